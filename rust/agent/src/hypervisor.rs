//! Hypervisor abstraction.
//!
//! The gRPC service only sees [`Hypervisor`]; the disk-cloning tool and the
//! VM monitor behind it can be swapped without touching the protocol.

use std::fmt;

use async_trait::async_trait;

use crate::error::{HypervisorError, HypervisorResult};

/// What to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
    pub name: String,
    pub cpu: u32,
    /// Memory in MiB.
    pub ram: u32,
    pub image: String,
}

impl DomainSpec {
    pub fn validate(&self) -> HypervisorResult<()> {
        validate_identifier("name", &self.name)?;
        validate_identifier("image", &self.image)?;
        if self.cpu == 0 {
            return Err(HypervisorError::InvalidRequest("cpu must be positive".into()));
        }
        if self.ram == 0 {
            return Err(HypervisorError::InvalidRequest("ram must be positive".into()));
        }
        Ok(())
    }
}

/// Names end up in dataset paths and domain XML, so only a conservative
/// character set is accepted.
pub fn validate_identifier(field: &str, value: &str) -> HypervisorResult<()> {
    if value.is_empty() {
        return Err(HypervisorError::InvalidRequest(format!("{field} must not be empty")));
    }
    if value.len() > 64 {
        return Err(HypervisorError::InvalidRequest(format!(
            "{field} must be at most 64 characters"
        )));
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !value.starts_with('.');
    if !valid {
        return Err(HypervisorError::InvalidRequest(format!(
            "{field} '{value}' may only contain letters, digits, '-', '_' and '.'"
        )));
    }
    Ok(())
}

/// Run state of a domain as the hypervisor reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainState {
    Running,
    /// Active but suspended; needs a resume rather than a start.
    Paused,
    Stopped,
    Crashed,
    /// Anything else (in shutdown, pmsuspended, ...), passed through verbatim.
    Other(String),
}

impl DomainState {
    /// Parse `virsh domstate` / `dominfo` wording.
    pub fn parse(raw: &str) -> DomainState {
        match raw.trim() {
            "running" => DomainState::Running,
            "paused" => DomainState::Paused,
            "shut off" | "shutoff" => DomainState::Stopped,
            "crashed" => DomainState::Crashed,
            other => DomainState::Other(other.to_string()),
        }
    }

    /// Wire representation used in state reports.
    pub fn as_str(&self) -> &str {
        match self {
            DomainState::Running => "running",
            DomainState::Paused => "paused",
            DomainState::Stopped => "stopped",
            DomainState::Crashed => "crashed",
            DomainState::Other(raw) => raw,
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain known to the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainStatus {
    pub name: String,
    pub state: DomainState,
    pub cpu: u32,
    /// Memory in MiB.
    pub ram: u32,
}

/// VM lifecycle on one node. Every operation is idempotent: repeating a
/// command that already took effect succeeds without doing anything.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Provision and boot, or boot an existing stopped domain.
    ///
    /// Returns a short description of what was done.
    async fn create(&self, spec: &DomainSpec) -> HypervisorResult<String>;

    /// Gracefully shut a domain down.
    async fn stop(&self, name: &str) -> HypervisorResult<String>;

    /// Remove a domain and its disk. Absent domains are not an error.
    async fn destroy(&self, name: &str) -> HypervisorResult<String>;

    async fn list(&self) -> HypervisorResult<Vec<DomainStatus>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_rules() {
        assert!(validate_identifier("name", "web1").is_ok());
        assert!(validate_identifier("image", "ubuntu-22.04").is_ok());
        assert!(validate_identifier("name", "").is_err());
        assert!(validate_identifier("name", "../etc").is_err());
        assert!(validate_identifier("name", "a b").is_err());
        assert!(validate_identifier("name", "x'><disk").is_err());
        assert!(validate_identifier("name", &"a".repeat(65)).is_err());
    }

    #[test]
    fn test_spec_validation() {
        let spec = DomainSpec {
            name: "web1".into(),
            cpu: 2,
            ram: 2048,
            image: "ubuntu-22.04".into(),
        };
        assert!(spec.validate().is_ok());
        assert!(DomainSpec { cpu: 0, ..spec.clone() }.validate().is_err());
        assert!(DomainSpec { ram: 0, ..spec }.validate().is_err());
    }

    #[test]
    fn test_domain_state_parse() {
        assert_eq!(DomainState::parse("running\n"), DomainState::Running);
        assert_eq!(DomainState::parse("shut off"), DomainState::Stopped);
        assert_eq!(DomainState::parse("crashed"), DomainState::Crashed);
        assert_eq!(DomainState::parse("paused"), DomainState::Paused);
        assert_eq!(DomainState::parse("in shutdown").as_str(), "in shutdown");
        assert_eq!(DomainState::Stopped.to_string(), "stopped");
    }
}
