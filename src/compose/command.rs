//! Invocation of the external compose tool.

use std::fmt;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use super::{ConvergeError, Project};

/// Where the tool's stdout/stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Forward each line into the structured log.
    #[default]
    Log,
    /// Share the agent's own stdout/stderr.
    Inherit,
}

/// The three directory-scoped operations the agent needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Pull,
    Up,
    Down,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    fn args(&self) -> &'static [&'static str] {
        match self {
            Self::Pull => &["pull"],
            Self::Up => &["up", "-d", "--remove-orphans"],
            Self::Down => &["down", "--remove-orphans"],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to launch the compose tool: a program plus leading arguments.
///
/// `docker-compose` is the default; the plugin form is `docker compose`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeCommand {
    program: String,
    args: Vec<String>,
}

impl ComposeCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. Returns `None` when blank.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self::new(program, words.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn build(&self, project: &Project, operation: Operation) -> Command {
        let manifest_path = project.manifest_path();
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("-p")
            .arg(project.name())
            .arg("-f")
            .arg(&manifest_path)
            .args(operation.args())
            .current_dir(project.dir())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Run `operation` for `project` and wait for it to exit.
    pub(crate) async fn run(
        &self,
        project: &Project,
        operation: Operation,
        output: OutputMode,
    ) -> Result<(), ConvergeError> {
        let mut cmd = self.build(project, operation);
        match output {
            OutputMode::Log => cmd.stdout(Stdio::piped()).stderr(Stdio::piped()),
            OutputMode::Inherit => cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit()),
        };

        tracing::info!(project = project.name(), %operation, "Running compose {}", operation);

        let mut child = cmd.spawn().map_err(|source| ConvergeError::Spawn {
            command: self.to_string(),
            source,
        })?;

        let stdout = forward_lines(child.stdout.take(), project.name(), operation, Stream::Stdout);
        let stderr = forward_lines(child.stderr.take(), project.name(), operation, Stream::Stderr);
        let (status, (), ()) = tokio::join!(child.wait(), stdout, stderr);

        let status = status.map_err(|source| ConvergeError::Spawn {
            command: self.to_string(),
            source,
        })?;

        if status.success() {
            tracing::info!(project = project.name(), %operation, "Compose {} succeeded", operation);
            Ok(())
        } else {
            Err(ConvergeError::Failed { operation, status })
        }
    }
}

impl Default for ComposeCommand {
    fn default() -> Self {
        Self::new("docker-compose", Vec::new())
    }
}

impl fmt::Display for ComposeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Copy a child stream into the log line by line.
///
/// Read errors end forwarding for that stream; they never fail the command.
async fn forward_lines<R>(stream: Option<R>, project: &str, operation: Operation, kind: Stream)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };

    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match kind {
                Stream::Stdout => tracing::info!(project, %operation, "{}", line),
                Stream::Stderr => tracing::warn!(project, %operation, "{}", line),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(project, %operation, error = %e, "Stopped capturing compose output");
                break;
            }
        }
    }
}
