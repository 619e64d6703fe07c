//! Convergence of a compose project toward a desired manifest.
//!
//! | desired              | manifest on disk | action                          |
//! |----------------------|------------------|---------------------------------|
//! | absent / empty       | no               | nothing                         |
//! | absent / empty       | yes              | `down`, then remove the file    |
//! | services             | any              | write the file, `pull`, `up -d` |

mod command;
mod project;

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::models::{FilteredManifest, ManifestError};

pub use command::{ComposeCommand, Operation, OutputMode};
pub use project::{project_name_for_key, Project, MANIFEST_FILE};

/// Errors raised while converging a project.
#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error("Filesystem error at '{path}': {source}", path = path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Compose {operation} failed: {status}")]
    Failed {
        operation: Operation,
        status: ExitStatus,
    },

    #[error(transparent)]
    Render(#[from] ManifestError),
}

/// What a successful convergence did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Nothing was deployed and nothing is wanted.
    AlreadyDown,
    /// The stack was stopped and its manifest removed.
    Down,
    /// The manifest was written and the stack pulled and started.
    Up,
}

/// Drives the compose tool for any number of projects.
///
/// Stateless apart from its configuration; the per-project state lives on
/// disk in [`Project`].
#[derive(Debug, Clone, Default)]
pub struct ComposeDriver {
    command: ComposeCommand,
    output: OutputMode,
}

impl ComposeDriver {
    pub fn new(command: ComposeCommand, output: OutputMode) -> Self {
        Self { command, output }
    }

    pub fn command(&self) -> &ComposeCommand {
        &self.command
    }

    /// Bring `project` in line with `desired`.
    ///
    /// `None` and a manifest without services both mean the stack should not
    /// be running.
    pub async fn converge(
        &self,
        project: &Project,
        desired: Option<&FilteredManifest>,
    ) -> Result<Convergence, ConvergeError> {
        match desired.filter(|manifest| !manifest.is_empty()) {
            Some(manifest) => self.up(project, manifest).await,
            None => self.down(project).await,
        }
    }

    async fn up(
        &self,
        project: &Project,
        manifest: &FilteredManifest,
    ) -> Result<Convergence, ConvergeError> {
        let content = manifest.render()?;

        tracing::info!(
            project = project.name(),
            path = %project.manifest_path().display(),
            services = ?manifest.service_names(),
            "Writing manifest"
        );
        tracing::debug!(project = project.name(), "Manifest content:\n{}", content);

        project
            .write_manifest(&content)
            .map_err(|source| ConvergeError::Filesystem {
                path: project.manifest_path(),
                source,
            })?;

        self.command
            .run(project, Operation::Pull, self.output)
            .await?;
        self.command.run(project, Operation::Up, self.output).await?;

        tracing::info!(project = project.name(), "Composed up");
        Ok(Convergence::Up)
    }

    async fn down(&self, project: &Project) -> Result<Convergence, ConvergeError> {
        if !project.has_manifest() {
            tracing::debug!(project = project.name(), "No manifest on disk, nothing to tear down");
            return Ok(Convergence::AlreadyDown);
        }

        self.command
            .run(project, Operation::Down, self.output)
            .await?;

        project
            .remove_manifest()
            .map_err(|source| ConvergeError::Filesystem {
                path: project.manifest_path(),
                source,
            })?;

        tracing::info!(project = project.name(), "Composed down");
        Ok(Convergence::Down)
    }
}
