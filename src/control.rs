use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("command cannot be empty")]
    EmptyCommand,
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: std::io::Error },
    #[error("{program} exited with {status}")]
    Failed { program: String, status: ExitStatus, output: String },
}

impl ControlError {
    /// Captured output to hand back to the operator, if the process ran.
    pub fn output(&self) -> String {
        match self {
            ControlError::Failed { output, .. } => output.clone(),
            ControlError::Spawn { source, .. } => source.to_string(),
            ControlError::EmptyCommand => String::new(),
        }
    }
}

/// Splits an operator command line on whitespace. No shell quoting.
pub fn split_command(line: &str) -> Result<Vec<String>, ControlError> {
    let argv: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Err(ControlError::EmptyCommand);
    }
    Ok(argv)
}

/// Runs `argv` to completion and returns stdout followed by stderr.
/// A non-zero exit is an error carrying the same captured text.
pub async fn run(argv: &[String]) -> Result<String, ControlError> {
    let (program, args) = argv.split_first().ok_or(ControlError::EmptyCommand)?;
    info!("exec: {}", argv.join(" "));

    let out = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ControlError::Spawn { program: program.clone(), source })?;

    let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
    output.push_str(&String::from_utf8_lossy(&out.stderr));

    if !out.status.success() {
        warn!("{} exited with {}", program, out.status);
        return Err(ControlError::Failed { program: program.clone(), status: out.status, output });
    }
    Ok(output)
}
