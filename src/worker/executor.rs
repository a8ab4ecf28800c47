use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::PayloadError;
use crate::worker::context::JobContext;

/// Environment variable carrying the job instance id to external payloads.
pub const INSTANCE_ID_ENV: &str = "JOBMESH_JOB_INSTANCE_ID";
/// Prefix of the environment variables carrying instance parameters.
pub const PARAMETER_ENV_PREFIX: &str = "JOBMESH_PARAM_";

/// Result of an external process run
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_instance_id: i64,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub killed: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        !self.killed && self.exit_code == Some(0)
    }

    pub fn into_result(self) -> Result<(), PayloadError> {
        if self.killed {
            return Err(PayloadError::Killed(self.job_instance_id));
        }
        if self.success() {
            return Ok(());
        }
        Err(PayloadError::Failed(self.error.unwrap_or_else(|| {
            format!("Exit code: {:?}", self.exit_code)
        })))
    }
}

/// Runs job definitions that launch an external program.
///
/// The child runs in the instance work directory with its parameters exported as
/// `JOBMESH_PARAM_<KEY>` variables. A kill request terminates the child.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(
        &self,
        ctx: &JobContext,
        program: &str,
        args: &[String],
    ) -> Result<ExecutionResult, PayloadError> {
        let work_dir = ctx.work_dir().await?;
        let job_instance_id = ctx.job_instance_id();
        tracing::info!(job_instance_id, program, "Launching external payload");

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&work_dir)
            .env(INSTANCE_ID_ENV, job_instance_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in ctx.parameters() {
            command.env(parameter_env_name(key), value);
        }

        Ok(Self::run(job_instance_id, command, ctx.kill_token(), &work_dir).await)
    }

    async fn run(
        job_instance_id: i64,
        mut command: Command,
        kill: &CancellationToken,
        work_dir: &Path,
    ) -> ExecutionResult {
        let result = tokio::select! {
            result = command.output() => Some(result),
            // Dropping the output future kills the child (kill_on_drop).
            _ = kill.cancelled() => None,
        };

        match result {
            None => {
                tracing::info!(job_instance_id, "External payload killed");
                ExecutionResult {
                    job_instance_id,
                    exit_code: None,
                    output: None,
                    error: Some("killed".to_string()),
                    killed: true,
                }
            }
            Some(result) => Self::process_output(job_instance_id, result, work_dir),
        }
    }

    fn process_output(
        job_instance_id: i64,
        result: Result<std::process::Output, std::io::Error>,
        work_dir: &Path,
    ) -> ExecutionResult {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                let error = if output.status.success() {
                    None
                } else if stderr.is_empty() {
                    Some(format!("Exit code: {:?}", exit_code))
                } else {
                    Some(stderr)
                };

                tracing::info!(
                    job_instance_id,
                    exit_code = ?exit_code,
                    work_dir = %work_dir.display(),
                    "External payload exited"
                );

                ExecutionResult {
                    job_instance_id,
                    exit_code,
                    output: if stdout.is_empty() { None } else { Some(stdout) },
                    error,
                    killed: false,
                }
            }
            Err(e) => {
                tracing::error!(
                    job_instance_id,
                    error = %e,
                    "External payload could not be launched"
                );
                ExecutionResult {
                    job_instance_id,
                    exit_code: None,
                    output: None,
                    error: Some(format!("launch failed: {e}")),
                    killed: false,
                }
            }
        }
    }
}

pub fn parameter_env_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{PARAMETER_ENV_PREFIX}{sanitized}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_names_are_sanitized() {
        assert_eq!(parameter_env_name("file.name"), "JOBMESH_PARAM_FILE_NAME");
        assert_eq!(parameter_env_name("Count"), "JOBMESH_PARAM_COUNT");
    }

    #[test]
    fn non_zero_exit_is_a_failure() {
        let result = ExecutionResult {
            job_instance_id: 1,
            exit_code: Some(2),
            output: None,
            error: Some("bad input".to_string()),
            killed: false,
        };
        assert!(!result.success());
        match result.into_result() {
            Err(PayloadError::Failed(msg)) => assert_eq!(msg, "bad input"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn killed_run_maps_to_killed_error() {
        let result = ExecutionResult {
            job_instance_id: 7,
            exit_code: None,
            output: None,
            error: None,
            killed: true,
        };
        assert!(matches!(result.into_result(), Err(PayloadError::Killed(7))));
    }

    #[test]
    fn launch_error_is_reported() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let result = ProcessExecutor::process_output(3, Err(err), Path::new("/tmp"));
        assert_eq!(result.exit_code, None);
        assert!(result.error.unwrap().contains("no such file"));
    }
}
