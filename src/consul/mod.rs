//! Control-plane access.
//!
//! The agent only needs two things from Consul: blocking reads of single KV
//! entries, and the leader probe used as a readiness gate at startup.

mod client;

pub use client::{ClientError, ConsulClient, KvPair, DEFAULT_ADDRESS};
