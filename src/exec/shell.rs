// src/exec/shell.rs

//! Built-in `shell` engine: runs the step prompt as a shell command.

use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::executor::{ExecutionFuture, ExecutionRequest, ExecutionResponse, Executor};

pub const ENGINE_ID: &str = "shell";

/// Runs `sh -c <prompt>` (or `cmd /C` on Windows).
///
/// Stdout becomes the step output; a non-zero exit is an executor error.
/// The child is killed when the execution future is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

impl Executor for ShellExecutor {
    fn execute(&self, request: ExecutionRequest) -> ExecutionFuture<'_> {
        Box::pin(run_command(request))
    }
}

async fn run_command(request: ExecutionRequest) -> anyhow::Result<ExecutionResponse> {
    info!(
        item = %request.work_item_id,
        attempt = request.attempt,
        cmd = %request.prompt,
        "starting shell step"
    );

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(&request.prompt);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&request.prompt);
        c
    };

    cmd.env("PROTORUN_STEP", &request.work_item_id)
        .env("PROTORUN_ATTEMPT", request.attempt.to_string())
        .env("PROTORUN_CONTEXT", request.context_refs.join(":"));
    if let Some(model) = &request.model {
        cmd.env("PROTORUN_MODEL", model);
    }
    if let Some(answer) = &request.answer {
        cmd.env("PROTORUN_ANSWER", answer);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for step '{}'", request.work_item_id))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Drain stderr so the pipe never fills; keep the tail for error detail.
    let item = request.work_item_id.clone();
    let stderr_task = tokio::spawn(async move {
        let mut tail: Vec<String> = Vec::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(item = %item, "stderr: {}", line);
                tail.push(line);
                if tail.len() > 20 {
                    tail.remove(0);
                }
            }
        }
        tail.join("\n")
    });

    let mut output = String::new();
    if let Some(mut stdout) = stdout {
        stdout
            .read_to_string(&mut output)
            .await
            .with_context(|| format!("reading stdout of step '{}'", request.work_item_id))?;
    }

    let status = child
        .wait()
        .await
        .with_context(|| format!("waiting for process of step '{}'", request.work_item_id))?;
    let stderr_tail = stderr_task.await.unwrap_or_default();

    let code = status.code().unwrap_or(-1);
    info!(
        item = %request.work_item_id,
        exit_code = code,
        success = status.success(),
        "shell step exited"
    );

    if status.success() {
        Ok(ExecutionResponse::success(output))
    } else {
        let mut detail = format!("exit code {code}");
        if !stderr_tail.is_empty() {
            detail.push_str(": ");
            detail.push_str(&stderr_tail);
        }
        let mut response = ExecutionResponse::error(detail);
        response.output = output;
        Ok(response)
    }
}
