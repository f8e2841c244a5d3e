//! Host command execution.

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{HypervisorError, HypervisorResult};

/// Runs host tools (`zfs`, `virsh`) and returns their stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// # Errors
    ///
    /// `Spawn` if the program cannot be started, `CommandFailed` on a
    /// non-zero exit.
    async fn run(&self, program: &str, args: &[String]) -> HypervisorResult<String>;
}

/// Render a command line for logs and error messages.
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs commands on the local host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> HypervisorResult<String> {
        let command = command_line(program, args);
        tracing::debug!(command = %command, "Running host command");

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| HypervisorError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(HypervisorError::CommandFailed {
                command,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    /// Records every command and answers from a script. Commands without a
    /// scripted answer succeed with empty output.
    #[derive(Default)]
    pub struct RecordingRunner {
        pub commands: Mutex<Vec<String>>,
        responses: Mutex<Vec<(String, VecDeque<HypervisorResult<String>>)>>,
    }

    impl RecordingRunner {
        /// Queue a response for the next command starting with `prefix`.
        pub fn respond(&self, prefix: &str, response: HypervisorResult<String>) {
            let mut responses = self.responses.lock();
            if let Some((_, queue)) = responses.iter_mut().find(|(p, _)| p == prefix) {
                queue.push_back(response);
            } else {
                responses.push((prefix.to_string(), VecDeque::from([response])));
            }
        }

        pub fn fail(&self, prefix: &str, stderr: &str) {
            self.respond(
                prefix,
                Err(HypervisorError::CommandFailed {
                    command: prefix.to_string(),
                    status: Some(1),
                    stderr: stderr.to_string(),
                }),
            );
        }

        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[String]) -> HypervisorResult<String> {
            let command = command_line(program, args);
            self.commands.lock().push(command.clone());

            // Longest matching prefix wins
            let mut responses = self.responses.lock();
            let best = responses
                .iter_mut()
                .filter(|(prefix, queue)| command.starts_with(prefix.as_str()) && !queue.is_empty())
                .max_by_key(|(prefix, _)| prefix.len());
            match best.and_then(|(_, queue)| queue.pop_front()) {
                Some(response) => response,
                None => Ok(String::new()),
            }
        }
    }
}
