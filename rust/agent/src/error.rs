use thiserror::Error;

/// Errors raised while driving the hypervisor.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// A host tool ran and exited unsuccessfully.
    #[error(
        "`{command}` failed with {}: {stderr}",
        .status.map_or_else(|| "no exit status".to_string(), |code| format!("exit status {code}"))
    )]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// A host tool could not be started at all.
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Domain '{0}' not found")]
    DomainNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for hypervisor operations
pub type HypervisorResult<T> = Result<T, HypervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = HypervisorError::CommandFailed {
            command: "zfs clone images/ubuntu-22.04@base vms/web1".into(),
            status: Some(1),
            stderr: "dataset already exists".into(),
        };
        assert_eq!(
            err.to_string(),
            "`zfs clone images/ubuntu-22.04@base vms/web1` failed with exit status 1: dataset already exists"
        );

        let err = HypervisorError::CommandFailed {
            command: "virsh start web1".into(),
            status: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("no exit status"));
    }
}
