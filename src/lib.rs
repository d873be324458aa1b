//! Giro - Client-Side Egress Manager
//!
//! Multiplexes outbound HTTP(S) requests across a pool of proxy circuits
//! while enforcing per-exit-IP rate limits for named user actions.
//!
//! ## Features
//!
//! - Circuit pool mixing HTTP, HTTPS, and SOCKS5 proxies with a locally
//!   supervised onion-routing daemon
//! - Rolling-window rate accounting per exit IP and named action, with a
//!   persistent JSON cache
//! - Single-flight exit IP changes with FIFO waiter fan-out
//! - Per-circuit exit IP pollers and a health/validity model
//! - Signal-driven exit rotation and daemon restart supervision
//! - Failure classification contract for the outer request engine

pub mod adapter;
pub mod circuit;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod pool;
pub mod poller;
pub mod probe;
pub mod rate;

pub use circuit::{Circuit, CircuitKind, CircuitScheme, SocksAgentOptions};
pub use client::Client;
pub use config::{CircuitConfig, ManagerConfig};
pub use coordinator::{ClientSpec, Coordinator};
pub use error::{GiroError, Result};
