//! Per-key watch loop.
//!
//! Each cycle issues one blocking read and reacts to what came back:
//!
//! - unreachable store: back off, keep the version
//! - missing key: converge to absent, back off, keep the version
//! - same version: read again immediately
//! - new version, empty value: converge to absent, advance
//! - new version, manifest: filter, converge, advance
//! - new version, unparseable: leave everything as is, back off
//!
//! Convergence failures are logged and never stop the loop; the next observed
//! change retries naturally.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::{wait_for_shutdown, WatchContext};
use crate::compose::{Convergence, Project};
use crate::config::Timings;
use crate::consul::{ClientError, KvPair};
use crate::models::{self, FilteredManifest};

/// Version marker meaning "nothing observed yet".
const NO_INDEX: u64 = 0;

/// What a single watch cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The control plane could not be read.
    Unreachable,
    /// The key does not exist; the project was converged to absent.
    NotFound { convergence: Option<Convergence> },
    /// The blocking read returned without a newer version.
    Unchanged,
    /// The store reported an older version than the one held; the marker
    /// was reset so the next read returns the current value.
    IndexReset { index: u64 },
    /// A new version was processed. `convergence` is `None` when the
    /// convergence action failed.
    Applied {
        index: u64,
        convergence: Option<Convergence>,
    },
    /// A new version could not be parsed and was not applied.
    Rejected { index: u64 },
}

impl CycleOutcome {
    /// Delay before the next read, if any.
    pub fn backoff(&self, timings: &Timings) -> Option<Duration> {
        match self {
            Self::Unreachable => Some(timings.transport_backoff),
            Self::NotFound { .. } => Some(timings.not_found_backoff),
            Self::Rejected { .. } => Some(timings.parse_error_backoff),
            Self::Unchanged | Self::IndexReset { .. } | Self::Applied { .. } => None,
        }
    }
}

/// Watches one key and converges its project.
#[derive(Debug)]
pub struct KeyWatcher {
    key: String,
    project: Project,
    context: Arc<WatchContext>,
    last_index: u64,
}

impl KeyWatcher {
    pub fn new(key: impl Into<String>, project: Project, context: Arc<WatchContext>) -> Self {
        Self {
            key: key.into(),
            project,
            context,
            last_index: NO_INDEX,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Version of the last successfully processed change.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    /// Run one full cycle: read, then process.
    pub async fn poll_once(&mut self) -> CycleOutcome {
        let read = self.read().await;
        self.process(read).await
    }

    /// Loop until `shutdown` flips to `true`.
    ///
    /// Shutdown interrupts the blocking read and backoff sleeps. A convergence
    /// action already running is allowed to finish.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(key = %self.key, project = self.project.name(), "Watching key");

        loop {
            let read = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                read = self.read() => read,
            };

            let outcome = self.process(read).await;
            tracing::trace!(key = %self.key, ?outcome, "Cycle finished");

            if let Some(delay) = outcome.backoff(&self.context.timings) {
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
        }

        tracing::info!(key = %self.key, index = self.last_index, "Stopped watching key");
    }

    async fn read(&self) -> Result<Option<KvPair>, ClientError> {
        self.context
            .client
            .get_kv(&self.key, self.last_index, self.context.timings.wait_time)
            .await
    }

    async fn process(&mut self, read: Result<Option<KvPair>, ClientError>) -> CycleOutcome {
        let pair = match read {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                tracing::info!(
                    key = %self.key,
                    "Key does not exist (will wait {:?})",
                    self.context.timings.not_found_backoff
                );
                let convergence = self.converge(None).await;
                return CycleOutcome::NotFound { convergence };
            }
            Err(e) => {
                tracing::warn!(
                    key = %self.key,
                    error = %e,
                    "Unable to get value for key (will wait {:?})",
                    self.context.timings.transport_backoff
                );
                return CycleOutcome::Unreachable;
            }
        };

        let index = pair.modify_index;
        if index == self.last_index {
            tracing::debug!(key = %self.key, index, "Key did not change");
            return CycleOutcome::Unchanged;
        }
        if index < self.last_index {
            tracing::warn!(
                key = %self.key,
                index,
                last_index = self.last_index,
                "Key index went backwards, resetting"
            );
            self.last_index = NO_INDEX;
            return CycleOutcome::IndexReset { index };
        }

        tracing::info!(key = %self.key, index, "Key changed");

        if pair.value.iter().all(u8::is_ascii_whitespace) {
            tracing::info!(key = %self.key, index, "Key is empty");
            let convergence = self.converge(None).await;
            self.last_index = index;
            return CycleOutcome::Applied { index, convergence };
        }

        match models::filter(&pair.value, &self.context.filter) {
            Ok(filtered) => {
                let convergence = self.converge(Some(&filtered)).await;
                self.last_index = index;
                CycleOutcome::Applied { index, convergence }
            }
            Err(e) => {
                tracing::warn!(
                    key = %self.key,
                    index,
                    error = %e,
                    "Unable to read manifest (will wait {:?})\n{}",
                    self.context.timings.parse_error_backoff,
                    String::from_utf8_lossy(&pair.value)
                );
                CycleOutcome::Rejected { index }
            }
        }
    }

    async fn converge(&self, desired: Option<&FilteredManifest>) -> Option<Convergence> {
        match self.context.driver.converge(&self.project, desired).await {
            Ok(convergence) => Some(convergence),
            Err(e) => {
                tracing::error!(
                    key = %self.key,
                    project = self.project.name(),
                    error = %e,
                    "Unable to converge project"
                );
                None
            }
        }
    }
}
