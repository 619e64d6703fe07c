//! Startup and shutdown of the key watchers.
//!
//! Lifecycle:
//! 1. wait for the control plane to elect a leader
//! 2. spawn one watcher task per key
//! 3. wait for the shutdown signal, stop the watchers
//! 4. tear every project down, one key at a time, in configuration order

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{KeyWatcher, WatchContext};
use crate::compose::{ComposeDriver, ConvergeError, Convergence, Project};
use crate::config::AgentConfig;
use crate::consul::ConsulClient;

/// Result of the forced teardown of one key.
#[derive(Debug)]
pub struct Teardown {
    pub key: String,
    pub outcome: Result<Convergence, ConvergeError>,
}

/// Per-key teardown results, in configuration order.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub teardowns: Vec<Teardown>,
}

impl ShutdownReport {
    pub fn keys(&self) -> Vec<&str> {
        self.teardowns.iter().map(|t| t.key.as_str()).collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.teardowns.iter().all(|t| t.outcome.is_ok())
    }
}

/// Runs one watcher per configured key and tears everything down on exit.
#[derive(Debug)]
pub struct Supervisor {
    config: AgentConfig,
    context: Arc<WatchContext>,
}

impl Supervisor {
    /// Validate `config` and build the shared collaborators.
    pub fn new(config: AgentConfig) -> anyhow::Result<Self> {
        config.validate().context("Invalid configuration")?;

        let client = ConsulClient::new(
            &config.consul.address,
            config.consul.token.clone(),
            config.consul.datacenter.clone(),
        )
        .context("Unable to create Consul API client")?;
        let driver = ComposeDriver::new(config.compose.clone(), config.output);
        let context = WatchContext::new(client, driver, config.filter.clone(), config.timings);

        Ok(Self { config, context })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run until `shutdown_signal` resolves, then tear down every project.
    ///
    /// Teardown also runs when the signal arrives before the control plane
    /// became ready.
    pub async fn run<F>(self, shutdown_signal: F) -> anyhow::Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        std::fs::create_dir_all(&self.config.work_dir).with_context(|| {
            format!(
                "Unable to create working folder: {}",
                self.config.work_dir.display()
            )
        })?;

        tokio::pin!(shutdown_signal);

        let ready = tokio::select! {
            _ = &mut shutdown_signal => false,
            _ = self.wait_until_ready() => true,
        };

        if ready {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let watchers = self.spawn_watchers(&shutdown_rx);

            shutdown_signal.await;
            tracing::info!("Shutting down, stopping {} watcher(s)", watchers.len());

            // Receivers are still held by the watchers; a send error only
            // means they have all exited already.
            let _ = shutdown_tx.send(true);
            self.stop_watchers(watchers).await;
        } else {
            tracing::info!("Shutting down before the control plane became ready");
        }

        Ok(self.teardown().await)
    }

    /// Block until the control plane reports a leader.
    async fn wait_until_ready(&self) {
        let interval = self.context.timings.readiness_interval;
        loop {
            match self.context.client.leader().await {
                Ok(Some(leader)) => {
                    tracing::info!(%leader, "Consul is ready");
                    return;
                }
                Ok(None) => {
                    tracing::warn!("Consul has no leader yet (will wait {:?})", interval);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Consul is not reachable (will wait {:?})", interval);
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn spawn_watchers(&self, shutdown: &watch::Receiver<bool>) -> Vec<(String, JoinHandle<()>)> {
        self.config
            .projects()
            .into_iter()
            .map(|(key, project)| {
                let watcher = KeyWatcher::new(key.clone(), project, Arc::clone(&self.context));
                let handle = tokio::spawn(watcher.run(shutdown.clone()));
                (key, handle)
            })
            .collect()
    }

    /// Wait for watchers to stop, aborting those still busy after the grace
    /// period.
    async fn stop_watchers(&self, watchers: Vec<(String, JoinHandle<()>)>) {
        let deadline = tokio::time::Instant::now() + self.context.timings.shutdown_grace;

        for (key, mut handle) in watchers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(key = %key, error = %e, "Watcher task failed");
                }
                Err(_) => {
                    tracing::warn!(key = %key, "Watcher did not stop in time, aborting it");
                    handle.abort();
                    // Wait for the abort so no convergence for this key is
                    // still running when its teardown starts.
                    let _ = handle.await;
                }
            }
        }
    }

    /// Converge every project to absent, sequentially, in configuration order.
    ///
    /// Failures are logged and reported, never retried.
    pub async fn teardown(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        for (key, project) in self.config.projects() {
            let outcome = self.teardown_one(&key, &project).await;
            report.teardowns.push(Teardown { key, outcome });
        }

        report
    }

    async fn teardown_one(
        &self,
        key: &str,
        project: &Project,
    ) -> Result<Convergence, ConvergeError> {
        tracing::info!(key, project = project.name(), "Tearing down");
        let outcome = self.context.driver.converge(project, None).await;
        match &outcome {
            Ok(convergence) => {
                tracing::info!(key, ?convergence, "Teardown finished");
            }
            Err(e) => {
                tracing::error!(key, error = %e, "Teardown failed");
            }
        }
        outcome
    }
}
