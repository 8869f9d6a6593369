use crate::messages::{Command, Variable};
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{self, Write},
    os::unix::process::ExitStatusExt,
    path::Path,
    process::{self, ExitStatus, Stdio},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// exit code reported for a command killed after its timeout
pub const TIMEOUT_EXIT_CODE: i32 = -1;
/// exit code reported for a command that could not be started
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// variables where task values are prepended to the inherited value
const SEARCH_PATH_VARIABLES: [&str; 2] = ["PATH", "LD_LIBRARY_PATH"];

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to open the output file {0:?}")]
    OutputFile(std::path::PathBuf, #[source] io::Error),
    #[error("Failed to wait for '{0}'")]
    Wait(String, #[source] io::Error),
}

/// Outcome of a command sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    /// exit code of the last executed command, 0 if all succeeded
    pub exit_code: i32,
    /// wall clock duration of every executed command, in ms
    pub durations: Vec<u64>,
}

/// Build the environment of a task
///
/// Only the search path variables are inherited. Task values for them are prepended, every other
/// task variable is set as is and TMPDIR points to the working directory.
pub fn build_environment(
    inherited: impl IntoIterator<Item = (String, String)>,
    variables: &[Variable],
    working_dir: &Path,
) -> BTreeMap<String, String> {
    let mut environment: BTreeMap<String, String> = inherited
        .into_iter()
        .filter(|(name, _)| SEARCH_PATH_VARIABLES.contains(&name.as_str()))
        .collect();

    for variable in variables {
        let value = match environment.get(&variable.name) {
            Some(current)
                if SEARCH_PATH_VARIABLES.contains(&variable.name.as_str()) && !current.is_empty() =>
            {
                format!("{}:{current}", variable.value)
            }
            _ => variable.value.clone(),
        };

        environment.insert(variable.name.clone(), value);
    }

    environment.insert(
        String::from("TMPDIR"),
        working_dir.to_string_lossy().into_owned(),
    );

    environment
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => TIMEOUT_EXIT_CODE,
    }
}

fn display(command: &Command) -> String {
    std::iter::once(command.program.as_str())
        .chain(command.arguments.iter().map(String::as_str))
        .join(" ")
}

/// Run one command inside `working_dir`, stdout and stderr are appended to `output`
#[tracing::instrument(level = "debug", skip(environment, output))]
pub fn run_command(
    command: &Command,
    working_dir: &Path,
    environment: &BTreeMap<String, String>,
    output: &File,
) -> Result<i32, ExecError> {
    let command_line = display(command);
    let (stdout, stderr) = match (output.try_clone(), output.try_clone()) {
        (Ok(stdout), Ok(stderr)) => (stdout, stderr),
        (Err(error), _) | (_, Err(error)) => return Err(ExecError::Wait(command_line, error)),
    };

    let mut child = match process::Command::new(&command.program)
        .args(&command.arguments)
        .current_dir(working_dir)
        .env_clear()
        .envs(environment)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
    {
        Ok(child) => child,
        Err(error) => {
            warn!(error = ?error, "Failed to start '{command_line}': {error}");

            let mut output = output;
            if let Err(error) = writeln!(output, "Failed to start '{command_line}': {error}") {
                warn!(error = ?error, "Failed to record the start failure: {error}");
            }

            return Ok(SPAWN_FAILURE_EXIT_CODE);
        }
    };

    let status = match command.timeout.filter(|timeout| *timeout > 0) {
        Some(timeout) => child
            .wait_timeout(Duration::from_secs(timeout))
            .map_err(|error| ExecError::Wait(command_line.clone(), error))?,
        None => Some(
            child
                .wait()
                .map_err(|error| ExecError::Wait(command_line.clone(), error))?,
        ),
    };

    match status {
        Some(status) => {
            debug!(status = ?status, "'{command_line}' terminated");

            Ok(exit_code(status))
        }
        None => {
            warn!("'{command_line}' ran into its timeout, killing it");

            if let Err(error) = child.kill() {
                warn!(error = ?error, "Failed to kill '{command_line}': {error}");
            }
            child
                .wait()
                .map_err(|error| ExecError::Wait(command_line, error))?;

            Ok(TIMEOUT_EXIT_CODE)
        }
    }
}

/// Run the commands in order and stop at the first one exiting with a non-zero code
pub fn run_commands(
    commands: &[Command],
    working_dir: &Path,
    environment: &BTreeMap<String, String>,
    output_path: &Path,
) -> Result<Execution, ExecError> {
    let output = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output_path)
        .map_err(|error| ExecError::OutputFile(output_path.to_path_buf(), error))?;

    let mut execution = Execution {
        exit_code: 0,
        durations: Vec::with_capacity(commands.len()),
    };

    for command in commands {
        let start = Instant::now();
        execution.exit_code = run_command(command, working_dir, environment, &output)?;
        execution.durations.push(start.elapsed().as_millis() as u64);

        if execution.exit_code != 0 {
            break;
        }
    }

    Ok(execution)
}
