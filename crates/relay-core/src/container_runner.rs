use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_config::Config;
use relay_types::{InvocationRequest, InvocationResult, RegisteredGroup, RelayError, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::mount_security::{build_mounts, MountSpec};

/// Anything that can carry out one agent invocation for a conversation.
///
/// Implementations never fail: every problem is reported as an error result.
pub trait AgentExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        group: &'a RegisteredGroup,
        request: InvocationRequest,
    ) -> Pin<Box<dyn Future<Output = InvocationResult> + Send + 'a>>;
}

/// Runs each invocation in a fresh, short-lived container.
pub struct ContainerRunner {
    config: Arc<Config>,
}

impl ContainerRunner {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Run one invocation to completion or timeout.
    pub async fn run(&self, group: &RegisteredGroup, request: &InvocationRequest) -> InvocationResult {
        let folder = group.folder.as_str();
        let start = Instant::now();
        let result = self.run_inner(group, request).await;

        if result.is_success() {
            info!(
                group = folder,
                duration_ms = start.elapsed().as_millis() as u64,
                "Container execution completed"
            );
        } else {
            warn!(
                group = folder,
                duration_ms = start.elapsed().as_millis() as u64,
                error = result.error.as_deref().unwrap_or(""),
                "Container execution failed"
            );
        }
        result
    }

    async fn run_inner(&self, group: &RegisteredGroup, request: &InvocationRequest) -> InvocationResult {
        let folder = group.folder.as_str();
        let (program, prefix_args) = match runtime_command(&self.config.container_runtime) {
            Ok(cmd) => cmd,
            Err(e) => return InvocationResult::error(e.to_string()),
        };

        let mounts = build_mounts(&self.config, group, request.is_main);
        let container_name = format!("relay-{folder}-{}", chrono::Utc::now().timestamp_millis());
        let args = build_run_args(&container_name, &mounts, &self.config.container_image);

        let input = match serde_json::to_vec(request) {
            Ok(bytes) => bytes,
            Err(e) => return InvocationResult::error(format!("Failed to encode request: {e}")),
        };

        let timeout_secs = group
            .timeout_override()
            .unwrap_or(self.config.container_timeout);
        let timeout = Duration::from_secs(timeout_secs);

        debug!(group = folder, container = %container_name, args = ?args, "Launching container");

        let mut child = match Command::new(&program)
            .args(&prefix_args)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return InvocationResult::error(format!("Failed to spawn {program}: {e}"));
            }
        };

        let stdin = child.stdin.take();
        let exchange = async move {
            if let Some(mut stdin) = stdin {
                // The process may exit without reading; its exit status decides the outcome.
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "Container closed stdin early");
                }
                drop(stdin);
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return InvocationResult::error(format!("Container process error: {e}"));
            }
            Err(_) => {
                // Dropping the exchange future killed the runtime client; stop the container too.
                tokio::spawn(stop_container(program, prefix_args, container_name));
                return InvocationResult::error(format!(
                    "Container timed out after {timeout_secs}s"
                ));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(group = folder, stderr = %truncate_tail(&stderr, 2000), "Container stderr");
        }

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return InvocationResult::error(format!(
                "Container exited with code {code}: {}",
                truncate_tail(stderr.trim(), 200)
            ));
        }

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let max = self.config.container_max_output_size;
        if stdout.len() > max {
            warn!(group = folder, size = stdout.len(), max, "Container output truncated");
            stdout = truncate_tail(&stdout, max).to_string();
        }

        match parse_invocation_output(&stdout) {
            Ok(result) => result,
            Err(e) => InvocationResult::error(e.to_string()),
        }
    }
}

impl AgentExecutor for ContainerRunner {
    fn execute<'a>(
        &'a self,
        group: &'a RegisteredGroup,
        request: InvocationRequest,
    ) -> Pin<Box<dyn Future<Output = InvocationResult> + Send + 'a>> {
        Box::pin(async move { self.run(group, &request).await })
    }
}

/// Split the configured runtime into program and leading arguments.
fn runtime_command(runtime: &str) -> Result<(String, Vec<String>)> {
    let mut parts = runtime.split_whitespace().map(str::to_string);
    let program = parts
        .next()
        .ok_or_else(|| RelayError::Config("CONTAINER_RUNTIME is empty".to_string()))?;
    Ok((program, parts.collect()))
}

/// Build `run` arguments (without the runtime binary itself).
pub fn build_run_args(container_name: &str, mounts: &[MountSpec], image: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-i".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container_name.to_string(),
    ];

    for mount in mounts {
        args.push("-v".to_string());
        args.push(mount.to_volume_arg());
    }

    args.push(image.to_string());
    args
}

/// Parse the last non-empty stdout line as the invocation result.
pub fn parse_invocation_output(stdout: &str) -> Result<InvocationResult> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| RelayError::Container("Container produced no output".to_string()))?;

    serde_json::from_str(line)
        .map_err(|e| RelayError::Container(format!("Failed to parse container output: {e}")))
}

/// Best-effort stop of a named container.
async fn stop_container(program: String, prefix_args: Vec<String>, name: String) {
    let stop = Command::new(&program)
        .args(&prefix_args)
        .args(["stop", name.as_str()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match tokio::time::timeout(Duration::from_secs(15), stop).await {
        Ok(Ok(status)) if status.success() => debug!(container = %name, "Container stopped"),
        Ok(Ok(status)) => debug!(container = %name, ?status, "Container stop returned non-zero"),
        Ok(Err(e)) => warn!(container = %name, error = %e, "Failed to stop container"),
        Err(_) => warn!(container = %name, "Timed out stopping container"),
    }
}

/// Keep at most the last `max` bytes of `s`, on a char boundary.
fn truncate_tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
