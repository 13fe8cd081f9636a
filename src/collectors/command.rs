use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

/// Runs `program` and returns its trimmed stdout, or `None` on spawn failure, non-zero exit,
/// empty output or timeout.
pub async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match time::timeout(timeout, output).await {
        Ok(Ok(out)) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        Ok(Ok(out)) => {
            debug!(program, status = %out.status, "command exited unsuccessfully");
            None
        }
        Ok(Err(err)) => {
            debug!(program, error = %err, "command failed to start");
            None
        }
        Err(_elapsed) => {
            debug!(program, timeout_ms = timeout.as_millis() as u64, "command timed out");
            None
        }
    }
}
