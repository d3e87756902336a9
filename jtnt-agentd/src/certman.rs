//! Client-side certificate rotation primitives.
//!
//! Scheduled expiry checks, Ed25519 CSR generation, and atomic install
//! with backup/rollback. Renewal orchestration (talking to the CA) lives
//! hub-side; the agent only rotates what it is handed.

use chrono::{DateTime, Local, Timelike, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer as _;

/// Renewal is flagged when expiry is this close.
const RENEWAL_THRESHOLD_DAYS: i64 = 30;

/// Backups older than this are deleted.
const BACKUP_RETENTION: std::time::Duration = std::time::Duration::from_secs(7 * 24 * 3600);

const BACKUP_SUFFIX: &str = "backup";
const NEW_SUFFIX: &str = "new";

#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to read certificate: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write certificate: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to parse certificate PEM")]
    Pem,

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("certificate is expired")]
    Expired,

    #[error("certificate is not yet valid")]
    NotYetValid,

    #[error("certificate does not allow client authentication")]
    MissingClientAuth,

    #[error("certificate does not chain to the supplied CA")]
    ChainInvalid,

    #[error("no backup certificate found")]
    NoBackup,

    #[error("failed to generate CSR: {0}")]
    Csr(#[from] rcgen::Error),
}

/// Result of an expiry check.
#[derive(Debug, Clone, Copy)]
pub struct ExpirationStatus {
    pub needs_renewal: bool,
    pub days_until_expiry: i64,
}

/// Manages the agent's client certificate files.
pub struct CertManager {
    cert_path: PathBuf,
    ca_bundle_path: PathBuf,
}

impl CertManager {
    pub fn new(cert_path: PathBuf, ca_bundle_path: PathBuf) -> Self {
        Self {
            cert_path,
            ca_bundle_path,
        }
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Read the installed certificate and report how close it is to
    /// expiry.
    pub fn check_expiration(&self) -> Result<ExpirationStatus, CertError> {
        let pem_data = std::fs::read(&self.cert_path).map_err(CertError::Read)?;
        let der = decode_single_pem(&pem_data)?;
        let (_, cert) =
            X509Certificate::from_der(&der).map_err(|err| CertError::Parse(err.to_string()))?;

        let not_after = cert.validity().not_after.timestamp();
        let seconds_left = not_after - Utc::now().timestamp();
        let days_until_expiry = seconds_left / 86_400;

        Ok(ExpirationStatus {
            needs_renewal: days_until_expiry <= RENEWAL_THRESHOLD_DAYS,
            days_until_expiry,
        })
    }

    /// Produce a PEM-encoded Ed25519 CSR with CN=`agent_id`, O=JTNT.
    #[allow(dead_code)] // Invoked by hub-driven renewal.
    pub fn generate_csr(&self, agent_id: &str) -> Result<String, CertError> {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)?;
        let mut params = rcgen::CertificateParams::default();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, agent_id);
        dn.push(rcgen::DnType::OrganizationName, "JTNT");
        params.distinguished_name = dn;
        let csr = params.serialize_request(&key)?;
        Ok(csr.pem()?)
    }

    /// Validate and install a new certificate atomically, backing up the
    /// current one first. The CA bundle is replaced the same way when
    /// provided.
    #[allow(dead_code)] // Invoked by hub-driven renewal.
    pub fn install_new_certificate(
        &self,
        cert_pem: &[u8],
        ca_bundle_pem: &[u8],
    ) -> Result<(), CertError> {
        validate_certificate(cert_pem, ca_bundle_pem)?;

        self.backup_current()?;

        let new_path = suffixed(&self.cert_path, NEW_SUFFIX);
        std::fs::write(&new_path, cert_pem).map_err(CertError::Write)?;
        set_owner_only(&new_path).map_err(CertError::Write)?;
        std::fs::rename(&new_path, &self.cert_path).map_err(CertError::Write)?;

        if !ca_bundle_pem.is_empty() {
            let new_ca_path = suffixed(&self.ca_bundle_path, NEW_SUFFIX);
            std::fs::write(&new_ca_path, ca_bundle_pem).map_err(CertError::Write)?;
            std::fs::rename(&new_ca_path, &self.ca_bundle_path).map_err(CertError::Write)?;
        }

        Ok(())
    }

    /// Restore the previous certificate from its backup.
    #[allow(dead_code)] // Invoked by hub-driven renewal.
    pub fn rollback(&self) -> Result<(), CertError> {
        let backup = suffixed(&self.cert_path, BACKUP_SUFFIX);
        if !backup.exists() {
            return Err(CertError::NoBackup);
        }
        std::fs::rename(&backup, &self.cert_path).map_err(CertError::Write)
    }

    /// Delete the backup once it has outlived the retention window.
    pub fn cleanup_old_backups(&self) -> Result<(), CertError> {
        let backup = suffixed(&self.cert_path, BACKUP_SUFFIX);
        let metadata = match std::fs::metadata(&backup) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(CertError::Read(err)),
        };
        if let Ok(modified) = metadata.modified() {
            if modified.elapsed().unwrap_or_default() > BACKUP_RETENTION {
                std::fs::remove_file(&backup).map_err(CertError::Write)?;
            }
        }
        Ok(())
    }

    fn backup_current(&self) -> Result<(), CertError> {
        let data = std::fs::read(&self.cert_path).map_err(CertError::Read)?;
        let backup = suffixed(&self.cert_path, BACKUP_SUFFIX);
        std::fs::write(&backup, data).map_err(CertError::Write)?;
        set_owner_only(&backup).map_err(CertError::Write)
    }
}

/// Parse, time-check, and chain-verify a candidate certificate against
/// the supplied CA bundle, requiring the clientAuth extended key usage.
fn validate_certificate(cert_pem: &[u8], ca_bundle_pem: &[u8]) -> Result<(), CertError> {
    let der = decode_single_pem(cert_pem)?;
    let (_, cert) =
        X509Certificate::from_der(&der).map_err(|err| CertError::Parse(err.to_string()))?;

    let now = Utc::now().timestamp();
    if now >= cert.validity().not_after.timestamp() {
        return Err(CertError::Expired);
    }
    if now < cert.validity().not_before.timestamp() {
        return Err(CertError::NotYetValid);
    }

    match cert.extended_key_usage() {
        Ok(Some(eku)) if eku.value.client_auth || eku.value.any => {}
        _ => return Err(CertError::MissingClientAuth),
    }

    // Chain check: an issuer in the bundle whose subject matches and whose
    // key verifies the certificate's signature.
    let ca_ders: Vec<Vec<u8>> = Pem::iter_from_buffer(ca_bundle_pem)
        .filter_map(|pem| pem.ok().map(|p| p.contents))
        .collect();
    if ca_ders.is_empty() {
        return Err(CertError::Pem);
    }

    for ca_der in &ca_ders {
        let Ok((_, ca_cert)) = X509Certificate::from_der(ca_der) else {
            continue;
        };
        if ca_cert.subject() != cert.issuer() {
            continue;
        }
        if cert.verify_signature(Some(ca_cert.public_key())).is_ok() {
            return Ok(());
        }
    }

    Err(CertError::ChainInvalid)
}

/// Whether a renewal check is due: once per day, after 03:00 local time.
pub fn should_check_renewal(last_check: Option<DateTime<Local>>) -> bool {
    let Some(last) = last_check else {
        return true;
    };
    let now = Local::now();
    now.signed_duration_since(last) >= chrono::Duration::hours(24) && now.hour() >= 3
}

fn decode_single_pem(data: &[u8]) -> Result<Vec<u8>, CertError> {
    let parsed = pem::parse(data).map_err(|_| CertError::Pem)?;
    Ok(parsed.contents().to_vec())
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
