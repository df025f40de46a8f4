// src/exec/command.rs

//! Shell commands behind suite-file fixtures and tasks.

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Exit status and captured stdout of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub success: bool,
    pub stdout: String,
}

/// Run `cmd` through the platform shell with `env` added to the environment.
///
/// Stdout is captured; stderr is drained and logged at debug level. The
/// child is killed if the returned future is dropped, which is how task
/// cancellation reaches the process.
pub async fn run_shell(label: &str, cmd: &str, env: &[(String, String)]) -> Result<CommandOutput> {
    debug!(label, cmd, "starting process");

    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    };

    command
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .with_context(|| format!("spawning process for '{label}'"))?;

    if let Some(stderr) = child.stderr.take() {
        let label = label.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(label = %label, "stderr: {}", line);
            }
        });
    }

    let mut stdout = String::new();
    if let Some(out) = child.stdout.take() {
        let mut lines = BufReader::new(out).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("reading stdout of '{label}'"))?
        {
            debug!(label, "stdout: {}", line);
            if !stdout.is_empty() {
                stdout.push('\n');
            }
            stdout.push_str(&line);
        }
    }

    let status = child
        .wait()
        .await
        .with_context(|| format!("waiting for process of '{label}'"))?;

    let exit_code = status.code().unwrap_or(-1);
    debug!(label, exit_code, success = status.success(), "process exited");

    Ok(CommandOutput {
        exit_code,
        success: status.success(),
        stdout: stdout.trim().to_string(),
    })
}

/// Like [`run_shell`], but a non-zero exit is an error.
pub async fn run_checked(label: &str, cmd: &str, env: &[(String, String)]) -> Result<String> {
    let output = run_shell(label, cmd, env).await?;
    if !output.success {
        bail!("command for '{label}' exited with status {}", output.exit_code);
    }
    Ok(output.stdout)
}

/// `COOP_FIXTURE_<NAME>`: upper-cased, anything not alphanumeric becomes `_`.
pub fn fixture_env_var(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("COOP_FIXTURE_{suffix}")
}
