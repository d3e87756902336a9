//! Non-loopback IPv4 address enumeration.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to enumerate interfaces: {0}")]
    Interfaces(#[from] nix::errno::Errno),
}

/// IPv4 addresses of interfaces that are up and not loopback.
pub fn ipv4_addresses() -> Result<Vec<String>, NetworkError> {
    use nix::net::if_::InterfaceFlags;

    let mut addrs = Vec::new();
    for ifaddr in nix::ifaddrs::getifaddrs()? {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
            || !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
        {
            continue;
        }
        let Some(storage) = ifaddr.address else {
            continue;
        };
        let Some(sin) = storage.as_sockaddr_in() else {
            continue;
        };
        let ip = sin.ip();
        if ip.is_loopback() {
            continue;
        }
        addrs.push(ip.to_string());
    }
    Ok(addrs)
}
