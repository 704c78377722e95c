// External-command driver.
//
// Runs `<program> [args..] <RESOURCE_TYPE> <resource-name>` with the
// operation JSON on stdin. Exit status zero is success; anything else is a
// rejection carrying the command's stderr.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{DriverError, ResourceDriver};
use crate::migration::ResourceKey;

#[derive(Debug, Clone)]
pub struct CommandDriver {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandDriver {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl ResourceDriver for CommandDriver {
    async fn apply(&self, key: &ResourceKey, operation: &Value) -> Result<(), DriverError> {
        let payload = serde_json::to_vec(operation)
            .map_err(|err| DriverError::Rejected(format!("unencodable operation: {err}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(key.resource_type.as_str())
            .arg(&key.resource_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A cancelled or timed-out call must not leave the child running.
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while draining stdout/stderr, so a chatty child never
        // blocks on a full pipe while we block on its stdin.
        let stdin = child.stdin.take();
        let feed = async move {
            match stdin {
                Some(mut stdin) => match stdin.write_all(&payload).await {
                    Ok(()) => stdin.shutdown().await,
                    Err(err) => Err(err),
                },
                None => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        match fed {
            // The child may exit without reading its input; its status decides.
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {}
            other => other?,
        }

        debug!(
            program = %self.program.display(),
            resource = %key,
            status = ?output.status.code(),
            "driver command finished"
        );

        if output.status.success() {
            Ok(())
        } else {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(DriverError::Rejected(format!(
                "`{}` exited with code {code}: {}",
                self.program.display(),
                stderr.trim()
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn zero_exit_is_success() {
        let driver = CommandDriver::new("sh").with_args(["-c", "cat >/dev/null", "driver"]);
        driver
            .apply(&ResourceKey::topic("orders"), &json!({ "partitions": 3 }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn arguments_and_payload_reach_the_command() {
        let script = r#"test "$1" = TOPIC && test "$2" = orders && grep -q partitions"#;
        let driver = CommandDriver::new("sh").with_args(["-c", script, "driver"]);
        driver
            .apply(&ResourceKey::topic("orders"), &json!({ "partitions": 3 }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_is_rejected_with_stderr() {
        let script = "cat >/dev/null; echo boom >&2; exit 3";
        let driver = CommandDriver::new("sh").with_args(["-c", script, "driver"]);
        let err = driver
            .apply(&ResourceKey::topic("orders"), &json!({}))
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("code 3"), "{message}");
        assert!(message.contains("boom"), "{message}");
    }

    #[tokio::test]
    async fn large_output_and_payload_do_not_deadlock() {
        // Fills the stdout pipe before reading any input.
        let script = "head -c 262144 /dev/zero; cat >/dev/null";
        let driver = CommandDriver::new("sh").with_args(["-c", script, "driver"]);
        let payload = json!({ "schema": "x".repeat(262_144) });

        tokio::time::timeout(
            std::time::Duration::from_secs(30),
            driver.apply(&ResourceKey::topic("orders"), &payload),
        )
        .await
        .expect("driver call deadlocked")
        .unwrap();
    }

    #[tokio::test]
    async fn child_ignoring_stdin_is_judged_by_exit_status() {
        let driver = CommandDriver::new("sh").with_args(["-c", "exit 0", "driver"]);
        let payload = json!({ "schema": "x".repeat(262_144) });

        driver
            .apply(&ResourceKey::topic("orders"), &payload)
            .await
            .unwrap();
    }
}
