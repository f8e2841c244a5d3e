//! VM records shared by the desired and observed sets.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Requested,
    Provisioning,
    Running,
    Stopped,
    Failed,
    Destroyed,
}

impl VmState {
    pub const ALL: [VmState; 6] = [
        VmState::Requested,
        VmState::Provisioning,
        VmState::Running,
        VmState::Stopped,
        VmState::Failed,
        VmState::Destroyed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Requested => "requested",
            VmState::Provisioning => "provisioning",
            VmState::Running => "running",
            VmState::Stopped => "stopped",
            VmState::Failed => "failed",
            VmState::Destroyed => "destroyed",
        }
    }

    /// `Destroyed` has no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Destroyed)
    }

    /// Observed states that mean an action is still under way.
    pub fn is_in_progress(self) -> bool {
        matches!(self, VmState::Requested | VmState::Provisioning)
    }

    /// The observed state a desired record asks the reconciler to reach.
    ///
    /// A freshly requested VM is a request to run it. `Provisioning` and
    /// `Failed` describe outcomes, not intent, so they have no target.
    pub fn target(self) -> Option<VmState> {
        match self {
            VmState::Requested | VmState::Running => Some(VmState::Running),
            VmState::Stopped => Some(VmState::Stopped),
            VmState::Destroyed => Some(VmState::Destroyed),
            VmState::Provisioning | VmState::Failed => None,
        }
    }

    /// Map a hypervisor agent's state string onto an observed state.
    pub fn from_agent(state: &str) -> Option<VmState> {
        match state.trim().to_ascii_lowercase().as_str() {
            "running" => Some(VmState::Running),
            "stopped" | "shutoff" | "shut off" => Some(VmState::Stopped),
            "crashed" | "failed" => Some(VmState::Failed),
            "destroyed" => Some(VmState::Destroyed),
            _ => None,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VmState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown VM state '{s}' (expected one of: requested, provisioning, running, stopped, failed, destroyed)"
                )
            })
    }
}

/// The two record collections kept by the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSet {
    /// Operator intent.
    Desired,
    /// Last known real-world state.
    Observed,
}

impl RecordSet {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordSet::Desired => "desired",
            RecordSet::Observed => "observed",
        }
    }
}

impl fmt::Display for RecordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desired" => Ok(RecordSet::Desired),
            "observed" => Ok(RecordSet::Observed),
            other => Err(format!("unknown record set '{other}' (expected desired or observed)")),
        }
    }
}

/// A single VM record. Desired and observed sets share this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    /// Unique, immutable identifier.
    pub name: String,
    /// Virtual core count.
    pub cpu: u32,
    /// Memory in MiB.
    pub ram: u32,
    /// Base image the VM is cloned from.
    pub image: String,
    pub state: VmState,
    /// Refreshed on every store write.
    pub updated_at: DateTime<Utc>,
    /// Set when the last action against this VM failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl VmRecord {
    pub fn new(
        name: impl Into<String>,
        cpu: u32,
        ram: u32,
        image: impl Into<String>,
        state: VmState,
    ) -> Self {
        Self {
            name: name.into(),
            cpu,
            ram,
            image: image.into(),
            state,
            updated_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(StoreError::InvalidRecord("name must not be empty".into()));
        }
        if self.cpu == 0 {
            return Err(StoreError::InvalidRecord(format!(
                "VM '{}': cpu must be positive",
                self.name
            )));
        }
        if self.ram == 0 {
            return Err(StoreError::InvalidRecord(format!(
                "VM '{}': ram must be positive",
                self.name
            )));
        }
        if self.image.trim().is_empty() {
            return Err(StoreError::InvalidRecord(format!(
                "VM '{}': image must not be empty",
                self.name
            )));
        }
        Ok(())
    }

    /// Derive an observed record from this one.
    pub fn observed_as(&self, state: VmState, last_error: Option<String>) -> VmRecord {
        VmRecord {
            state,
            last_error,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn spec(&self) -> VmSpec {
        VmSpec {
            name: self.name.clone(),
            cpu: self.cpu,
            ram: self.ram,
            image: self.image.clone(),
        }
    }
}

/// Payload of a create command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub cpu: u32,
    pub ram: u32,
    pub image: String,
}

/// A VM as reported by a hypervisor agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVmStatus {
    pub name: String,
    /// Agent-native state string, see [`VmState::from_agent`].
    pub state: String,
    pub cpu: u32,
    pub ram: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&VmState::Provisioning).unwrap();
        assert_eq!(json, "\"provisioning\"");
        let back: VmState = serde_json::from_str("\"destroyed\"").unwrap();
        assert_eq!(back, VmState::Destroyed);
    }

    #[test]
    fn test_state_from_str() {
        assert_eq!("Running".parse::<VmState>().unwrap(), VmState::Running);
        assert!("rebooting".parse::<VmState>().is_err());
    }

    #[test]
    fn test_targets() {
        assert_eq!(VmState::Requested.target(), Some(VmState::Running));
        assert_eq!(VmState::Running.target(), Some(VmState::Running));
        assert_eq!(VmState::Stopped.target(), Some(VmState::Stopped));
        assert_eq!(VmState::Destroyed.target(), Some(VmState::Destroyed));
        assert_eq!(VmState::Provisioning.target(), None);
        assert_eq!(VmState::Failed.target(), None);
        assert!(VmState::Destroyed.is_terminal());
        assert!(!VmState::Failed.is_terminal());
    }

    #[test]
    fn test_agent_state_mapping() {
        assert_eq!(VmState::from_agent("running"), Some(VmState::Running));
        assert_eq!(VmState::from_agent("shut off"), Some(VmState::Stopped));
        assert_eq!(VmState::from_agent("crashed"), Some(VmState::Failed));
        assert_eq!(VmState::from_agent("paused"), None);
    }

    #[test]
    fn test_validate_rejects_bad_records() {
        let ok = VmRecord::new("web1", 2, 2048, "ubuntu-22.04", VmState::Running);
        assert!(ok.validate().is_ok());

        let mut bad = ok.clone();
        bad.cpu = 0;
        assert!(matches!(bad.validate(), Err(StoreError::InvalidRecord(_))));

        let mut bad = ok.clone();
        bad.name = "  ".into();
        assert!(matches!(bad.validate(), Err(StoreError::InvalidRecord(_))));

        let mut bad = ok;
        bad.image = String::new();
        assert!(matches!(bad.validate(), Err(StoreError::InvalidRecord(_))));
    }

    #[test]
    fn test_last_error_omitted_when_absent() {
        let record = VmRecord::new("web1", 2, 2048, "ubuntu-22.04", VmState::Running);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("last_error").is_none());
        assert_eq!(json["state"], "running");
    }
}
