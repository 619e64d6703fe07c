//! Shared test fixtures: an in-process fake Consul agent and a fake compose
//! tool that records its invocations.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path as UrlPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::Engine;
use serde::Deserialize;
use tokio::sync::Notify;

use executant::agent::WatchContext;
use executant::compose::{ComposeCommand, ComposeDriver, OutputMode};
use executant::config::Timings;
use executant::consul::ConsulClient;
use executant::models::LabelFilter;

/// Label used by the fixtures' filter.
pub const ENABLED: &str = "executant.enabled=true";

/// Timings short enough for tests.
pub fn fast_timings() -> Timings {
    Timings {
        wait_time: Duration::from_millis(200),
        transport_backoff: Duration::from_millis(50),
        not_found_backoff: Duration::from_millis(50),
        parse_error_backoff: Duration::from_millis(50),
        readiness_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_secs(5),
    }
}

/// A compose document with one service per `(name, labels)` pair.
pub fn compose_yaml(services: &[(&str, &[&str])]) -> String {
    let mut yaml = String::from("version: \"3\"\nservices:\n");
    for (name, labels) in services {
        yaml.push_str(&format!("  {}:\n    image: {}:latest\n", name, name));
        if !labels.is_empty() {
            yaml.push_str("    labels:\n");
            for label in *labels {
                yaml.push_str(&format!("      - \"{}\"\n", label));
            }
        }
    }
    yaml
}

// ============================================================
// Fake Consul
// ============================================================

#[derive(Default)]
struct ConsulState {
    entries: HashMap<String, (Vec<u8>, u64)>,
    index: u64,
    leader: String,
    failing: bool,
    kv_reads: usize,
    last_token: Option<String>,
}

/// Minimal Consul agent: KV blocking reads and the leader probe.
#[derive(Clone)]
pub struct FakeConsul {
    state: Arc<Mutex<ConsulState>>,
    changed: Arc<Notify>,
    address: String,
}

#[derive(Debug, Deserialize)]
struct KvQuery {
    index: Option<u64>,
    wait: Option<String>,
}

impl FakeConsul {
    /// Start serving on an ephemeral local port.
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(ConsulState {
            leader: "127.0.0.1:8300".to_string(),
            ..Default::default()
        }));
        let changed = Arc::new(Notify::new());

        let app = Router::new()
            .route("/v1/kv/{*key}", get(read_key))
            .route("/v1/status/leader", get(leader))
            .with_state((state.clone(), changed.clone()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake Consul");
        let address = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Fake Consul failed");
        });

        Self {
            state,
            changed,
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn client(&self) -> ConsulClient {
        ConsulClient::new(&self.address, None, None).expect("Failed to create client")
    }

    /// Store `value` under `key` and return its new modify index.
    pub fn put(&self, key: &str, value: impl AsRef<[u8]>) -> u64 {
        let index = {
            let mut state = self.state.lock().unwrap();
            state.index += 1;
            let index = state.index;
            state
                .entries
                .insert(key.to_string(), (value.as_ref().to_vec(), index));
            index
        };
        self.changed.notify_waiters();
        index
    }

    /// Store `value` with an explicit modify index.
    pub fn put_at(&self, key: &str, value: impl AsRef<[u8]>, index: u64) {
        let mut state = self.state.lock().unwrap();
        state
            .entries
            .insert(key.to_string(), (value.as_ref().to_vec(), index));
        state.index = state.index.max(index);
    }

    pub fn delete(&self, key: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.index += 1;
            state.entries.remove(key);
        }
        self.changed.notify_waiters();
    }

    pub fn set_leader(&self, leader: &str) {
        self.state.lock().unwrap().leader = leader.to_string();
    }

    /// Make KV reads answer with a server error.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    pub fn kv_reads(&self) -> usize {
        self.state.lock().unwrap().kv_reads
    }

    pub fn last_token(&self) -> Option<String> {
        self.state.lock().unwrap().last_token.clone()
    }
}

type SharedState = (Arc<Mutex<ConsulState>>, Arc<Notify>);

fn parse_wait(wait: Option<&str>) -> Duration {
    wait.and_then(|w| w.strip_suffix("ms"))
        .and_then(|ms| ms.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(1))
}

async fn read_key(
    State((state, changed)): State<SharedState>,
    UrlPath(key): UrlPath<String>,
    Query(query): Query<KvQuery>,
    headers: HeaderMap,
) -> Response {
    let wanted = query.index.unwrap_or(0);

    {
        let mut state = state.lock().unwrap();
        state.kv_reads += 1;
        state.last_token = headers
            .get("X-Consul-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if state.failing {
            return (StatusCode::INTERNAL_SERVER_ERROR, "simulated failure").into_response();
        }
    }

    let current = || state.lock().unwrap().entries.get(&key).cloned();

    let entry = match current() {
        Some((_, index)) if wanted != 0 && index == wanted => {
            let _ = tokio::time::timeout(parse_wait(query.wait.as_deref()), changed.notified()).await;
            current()
        }
        entry => entry,
    };

    match entry {
        Some((value, index)) => {
            let encoded = if value.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(&value))
            };
            Json(serde_json::json!([{
                "Key": key,
                "Value": encoded,
                "CreateIndex": index,
                "ModifyIndex": index,
                "LockIndex": 0,
                "Flags": 0,
            }]))
            .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn leader(State((state, _)): State<SharedState>) -> Json<String> {
    Json(state.lock().unwrap().leader.clone())
}

// ============================================================
// Fake compose tool
// ============================================================

const SCRIPT: &str = r#"
# Called as: -p <project> -f <file> <operation> [flags...]
echo "$2 $5 $(pwd)" >> "__DIR__/invocations.log"
if [ -e "__DIR__/slow-$5" ]; then
    exec sleep "$(cat "__DIR__/slow-$5")"
fi
if [ -e "__DIR__/fail-$5" ]; then
    echo "simulated $5 failure" >&2
    exit 1
fi
echo "$5 done"
"#;

/// One recorded call of the fake compose tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub project: String,
    pub operation: String,
    pub cwd: PathBuf,
}

/// A shell script standing in for `docker-compose`.
///
/// It is run through `/bin/sh` rather than executed directly so tests never
/// exec a file that was just written.
pub struct FakeCompose {
    dir: tempfile::TempDir,
}

impl FakeCompose {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let script = SCRIPT.replace("__DIR__", &dir.path().display().to_string());
        std::fs::write(dir.path().join("compose.sh"), script).expect("Failed to write script");
        Self { dir }
    }

    pub fn command(&self) -> ComposeCommand {
        ComposeCommand::new(
            "/bin/sh",
            vec![self.dir.path().join("compose.sh").display().to_string()],
        )
    }

    pub fn driver(&self) -> ComposeDriver {
        ComposeDriver::new(self.command(), OutputMode::Log)
    }

    /// Make every later call of `operation` exit non-zero.
    pub fn fail(&self, operation: &str) {
        std::fs::write(self.dir.path().join(format!("fail-{}", operation)), "")
            .expect("Failed to write marker");
    }

    /// Make every later call of `operation` hang for `seconds`.
    pub fn stall(&self, operation: &str, seconds: u64) {
        std::fs::write(
            self.dir.path().join(format!("slow-{}", operation)),
            seconds.to_string(),
        )
        .expect("Failed to write marker");
    }

    pub fn recover(&self, operation: &str) {
        let _ = std::fs::remove_file(self.dir.path().join(format!("fail-{}", operation)));
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        let log = match std::fs::read_to_string(self.dir.path().join("invocations.log")) {
            Ok(log) => log,
            Err(_) => return Vec::new(),
        };
        log.lines()
            .filter_map(|line| {
                let mut parts = line.splitn(3, ' ');
                Some(Invocation {
                    project: parts.next()?.to_string(),
                    operation: parts.next()?.to_string(),
                    cwd: PathBuf::from(parts.next()?),
                })
            })
            .collect()
    }

    /// Operations in call order, for one project.
    pub fn operations_for(&self, project: &str) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter(|i| i.project == project)
            .map(|i| i.operation)
            .collect()
    }
}

/// A watch context wired to the fakes.
pub fn context(consul: &FakeConsul, compose: &FakeCompose) -> Arc<WatchContext> {
    WatchContext::new(
        consul.client(),
        compose.driver(),
        LabelFilter::new([ENABLED]),
        fast_timings(),
    )
}

/// Read a project's manifest, if present.
pub fn manifest_at(dir: &Path) -> Option<String> {
    std::fs::read_to_string(dir.join(executant::compose::MANIFEST_FILE)).ok()
}

/// Poll `condition` until it holds, failing the test after ten seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Condition not met in time");
}
