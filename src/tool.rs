use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{Command, Output};

use tracing::debug;

use crate::error::BeaconError;

/// Captured result of an external program run to completion.
#[derive(Debug)]
pub struct ToolRun {
    pub command: String,
    pub output: Output,
}

impl ToolRun {
    pub fn success(&self) -> bool {
        self.output.status.success()
    }

    pub fn code(&self) -> Option<i32> {
        self.output.status.code()
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.output.stdout).trim().to_string()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.output.stderr).trim().to_string()
    }
}

pub fn command_line(program: &Path, args: &[OsString]) -> String {
    std::iter::once(program.as_os_str())
        .chain(args.iter().map(|arg| arg.as_os_str()))
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs `program` with piped stdout/stderr. Only spawn failures are errors
/// here; the exit status is left to the caller.
pub fn run_tool(
    program: &Path,
    args: &[OsString],
    cwd: Option<&Path>,
) -> Result<ToolRun, BeaconError> {
    let command = command_line(program, args);
    debug!(command = %command, "running external tool");
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let output = cmd.output().map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => BeaconError::MissingTool(program.display().to_string()),
        _ => BeaconError::Filesystem(format!("spawn `{command}`: {err}")),
    })?;
    Ok(ToolRun { command, output })
}
