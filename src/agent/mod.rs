//! The watch-and-converge agent.
//!
//! A [`Supervisor`] owns one [`KeyWatcher`] per configured key. Watchers run
//! as independent tasks and share only the read-only [`WatchContext`]; each
//! writes exclusively to its own project directory.

mod supervisor;
mod watcher;

use std::sync::Arc;

use tokio::sync::watch;

use crate::compose::ComposeDriver;
use crate::config::Timings;
use crate::consul::ConsulClient;
use crate::models::LabelFilter;

pub use supervisor::{ShutdownReport, Supervisor, Teardown};
pub use watcher::{CycleOutcome, KeyWatcher};

/// Collaborators shared by every watcher.
#[derive(Debug, Clone)]
pub struct WatchContext {
    pub client: ConsulClient,
    pub driver: ComposeDriver,
    pub filter: LabelFilter,
    pub timings: Timings,
}

impl WatchContext {
    pub fn new(
        client: ConsulClient,
        driver: ComposeDriver,
        filter: LabelFilter,
        timings: Timings,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            driver,
            filter,
            timings,
        })
    }
}

/// Resolve once `true` has been sent, or the sender is gone.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
