//! Signed capability policy and its enforcer.
//!
//! A policy is delivered at enrollment and refreshed from the hub. It is
//! validated on every load and never mutated in place: a new version
//! replaces the whole document. The enforcer answers "may I do X?" for
//! every privileged action the job handlers take.

mod allowlist;
mod enforcer;
mod model;

pub use allowlist::{Allowlist, allows_binary, validate_path};
pub use enforcer::{Enforcer, PolicyViolation};
pub use model::{
    Capabilities, ExecCapability, FileCapability, Policy, PolicyError, ScriptCapability,
};
