//! Execution of external backup tools.
//!
//! [`CommandRunner`] runs a single process or a producer piped into a
//! compressor ([`piped::PipedCommand`]), captures its output and honours the
//! dry-run mode of the current run.

pub mod piped;

use crate::backup::command::piped::PipedCommand;
use crate::backup::function_path;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddDetails, AddFunctionName};
use bon::Builder;
use function_name::named;
use getset::{CopyGetters, Getters};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// One invocation of an external tool.
#[derive(Clone, Debug, Builder, Getters, CopyGetters)]
pub struct ExecRequest {
    #[builder(into)]
    #[getset(get = "pub")]
    argv: Vec<String>,
    /// Added on top of the inherited environment; values never reach the logs.
    #[builder(default)]
    #[getset(get = "pub")]
    env: BTreeMap<String, RedactedString>,
    /// Standard output is written to this file instead of being captured.
    #[builder(into)]
    #[getset(get = "pub")]
    out_path: Option<PathBuf>,
    /// Compressor command line; only used together with `out_path`.
    #[builder(into)]
    #[getset(get = "pub")]
    compressor: Option<Vec<String>>,
    /// Execute even in dry-run mode, for tools that simulate on their own.
    #[builder(default)]
    #[getset(get_copy = "pub")]
    force_exec: bool,
}

impl ExecRequest {
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lines(&self) -> Vec<String> {
        split_msg(&String::from_utf8_lossy(&self.stdout))
    }

    pub fn stderr_lines(&self) -> Vec<String> {
        split_msg(&String::from_utf8_lossy(&self.stderr))
    }

    /// Turns a non-zero exit code into a command error carrying the stderr lines.
    pub fn check<S: AsRef<str>>(self, what: S) -> Result<ExecOutput> {
        if self.success() {
            return Ok(self);
        }
        Err(Error::command(format!(
            "{} failed with error code: {}.",
            what.as_ref(),
            self.exit_code
        ))
        .add_details(self.stderr_lines()))
    }
}

/// Splits multi-line tool output into its non-blank lines.
pub fn split_msg(msg: &str) -> Vec<String> {
    msg.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_owned)
        .collect()
}

#[derive(Clone, Copy, Debug, Default, CopyGetters)]
pub struct CommandRunner {
    #[getset(get_copy = "pub")]
    dry_run: bool,
}

impl CommandRunner {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    #[named]
    pub fn run(&self, request: &ExecRequest) -> Result<ExecOutput> {
        if request.argv.is_empty() {
            return Err(Error::command("Empty command line.")).add_fn_name(function_path!());
        }
        let command_line = request.command_line();

        if self.dry_run && !request.force_exec {
            tracing::info!("Dry-run, command not executed: {command_line}");
            if let Some(out_path) = &request.out_path {
                tracing::info!("Dry-run, output would be written to: {:?}", out_path);
            }
            return Ok(ExecOutput::default());
        }

        // A forced tool simulates on its own, its output is not persisted.
        let out_path = request.out_path.as_deref().filter(|_| !self.dry_run);
        tracing::debug!("Executing command: {command_line}");

        let output = match (out_path, request.compressor.as_deref()) {
            (Some(out_path), Some(compressor)) => {
                tracing::debug!(
                    "Output piped through {:?} into {:?}",
                    compressor.join(" "),
                    out_path
                );
                PipedCommand::new(&request.argv, compressor, &request.env).run(out_path)
            }
            (Some(out_path), None) => run_to_file(request, out_path),
            (None, compressor) => {
                if compressor.is_some() && !self.dry_run {
                    tracing::warn!("Compression requested without output file, ignored");
                }
                run_captured(request)
            }
        }
        .add_fn_name(function_path!())?;

        tracing::debug!("Command finished with exit code {}: {command_line}", output.exit_code);
        Ok(output)
    }
}

pub(crate) fn new_command(argv: &[String], env: &BTreeMap<String, RedactedString>) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .envs(env.iter().map(|(k, v)| (k, v.inner())))
        .stdin(Stdio::null());
    cmd
}

pub(crate) fn spawn_error(argv: &[String], e: std::io::Error) -> Error {
    Error::command(format!("Execution of command failed: {}", argv.join(" ")))
        .add_details(vec![e.to_string()])
}

pub(crate) fn create_output_file(path: &Path) -> Result<File> {
    File::create(path).map_err(|e| {
        Error::file_create(format!("Creation of output file {:?} failed.", path))
            .add_details(vec![e.to_string()])
    })
}

pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn run_to_file(request: &ExecRequest, out_path: &Path) -> Result<ExecOutput> {
    let out_file = create_output_file(out_path)?;
    let output = new_command(&request.argv, &request.env)
        .stdout(Stdio::from(out_file))
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| spawn_error(&request.argv, e))?;

    Ok(ExecOutput {
        exit_code: exit_code(output.status),
        stdout: Vec::new(),
        stderr: output.stderr,
    })
}

fn run_captured(request: &ExecRequest) -> Result<ExecOutput> {
    let output = new_command(&request.argv, &request.env)
        .output()
        .map_err(|e| spawn_error(&request.argv, e))?;

    Ok(ExecOutput {
        exit_code: exit_code(output.status),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}
