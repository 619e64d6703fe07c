//! executant: converge local docker-compose stacks to manifests kept in Consul.
//!
//! Each configured Consul key holds a compose file. The agent long-polls the
//! key, keeps only the services carrying one of the configured labels, writes
//! the result to `<work_dir>/<project>/docker-compose.yml` and runs
//! `docker-compose` to bring the stack up, or down once the key is gone or no
//! service survives the filter.

pub mod agent;
pub mod compose;
pub mod config;
pub mod consul;
pub mod models;
