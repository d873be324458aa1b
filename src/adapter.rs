//! Request adapter contract
//!
//! The retry engine itself lives outside this crate; what is defined here
//! is the contract it drives: how each outbound request is tagged with its
//! circuit's connection parameters, and how failure messages map to
//! backoff, rotation, and daemon-restart decisions.

use std::time::Duration;

use tracing::{debug, warn};

use crate::circuit::{POLL_DEGRADE_AMOUNT, POLL_HEAL_AMOUNT};
use crate::client::Client;
use crate::error::Result;

/// Known transient SOCKS/TLS failure substrings: back off and retry
pub const TRANSIENT_PROXY_ERRORS: &[&str] = &[
    "socket hang up",
    "SOCKS connection failed. Host unreachable.",
    "SOCKS connection failed. Connection not allowed by ruleset",
    "SSL23_GET_SERVER_HELLO",
    "SSL3_GET_RECORD:wrong version number",
    "SOCKS connection failed. General SOCKS server failure.",
];

/// TLS failures that suggest the exit is tampering: rotate away
pub const SUSPICIOUS_TLS_ERRORS: &[&str] = &[
    "unable to verify the first certificate",
    "self signed certificate",
    "self signed certificate in certificate chain",
    "Hostname/IP does not match certificate's altnames",
    "SSL3_GET_RECORD:decryption failed or bad record mac",
    "unable to get local issuer certificate",
];

/// Failure that, in a storm, calls for restarting the daemon outright
pub const TTL_EXPIRED_ERROR: &str = "SOCKS connection failed. TTL expired.";

const HOST_UNREACHABLE: &str = "SOCKS connection failed. Host unreachable.";

/// Attempts beyond this degrade a polling circuit's health
pub const POLL_FAILURE_THRESHOLD: u32 = 3;

/// Failure classification bands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureBand {
    TtlExpired,
    TransientProxy,
    SuspiciousTls,
    Other,
}

/// Classify a failure message by exact substring
pub fn classify_failure(message: &str) -> FailureBand {
    if message.contains(TTL_EXPIRED_ERROR) {
        FailureBand::TtlExpired
    } else if TRANSIENT_PROXY_ERRORS.iter().any(|e| message.contains(e)) {
        FailureBand::TransientProxy
    } else if SUSPICIOUS_TLS_ERRORS.iter().any(|e| message.contains(e)) {
        FailureBand::SuspiciousTls
    } else {
        FailureBand::Other
    }
}

/// What the retry engine should do with a failed request
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    /// Wait before the next attempt; `None` leaves the engine's default
    pub backoff: Option<Duration>,
    /// How much of the attempt counter to rewind before retrying
    pub rewind_attempts: f64,
    /// Rotate the client's exit before retrying
    pub rotate: bool,
    /// Kill and respawn the daemon before surfacing the failure
    pub restart_daemon: bool,
}

impl Default for RetryDecision {
    fn default() -> Self {
        Self {
            backoff: None,
            rewind_attempts: 0.0,
            rotate: false,
            restart_daemon: false,
        }
    }
}

/// Map a failure message and attempt count to a retry decision
pub fn retry_decision(message: &str, attempts: u32, onion_routed: bool) -> RetryDecision {
    match classify_failure(message) {
        FailureBand::TransientProxy => {
            if message.contains(HOST_UNREACHABLE) && attempts < 5 {
                // The exit may simply be gone: rotate quickly and give the
                // attempt most of its budget back.
                RetryDecision {
                    backoff: Some(Duration::from_millis(500)),
                    rewind_attempts: 0.9,
                    rotate: true,
                    restart_daemon: false,
                }
            } else if attempts > 5 {
                RetryDecision {
                    backoff: Some(Duration::from_secs(180)),
                    rotate: true,
                    ..RetryDecision::default()
                }
            } else {
                RetryDecision {
                    backoff: Some(Duration::from_secs(60)),
                    ..RetryDecision::default()
                }
            }
        }
        FailureBand::SuspiciousTls => RetryDecision {
            rotate: true,
            ..RetryDecision::default()
        },
        FailureBand::TtlExpired if onion_routed && attempts > 3 => RetryDecision {
            restart_daemon: true,
            ..RetryDecision::default()
        },
        FailureBand::TtlExpired | FailureBand::Other => RetryDecision::default(),
    }
}

/// Connection parameters the request engine tags each request with
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyParams {
    /// SOCKS agent configuration, for socks5h circuits
    Socks(crate::circuit::SocksAgentOptions),
    /// Proxy URL, for HTTP(S) circuits
    Url(String),
}

/// Resolve the proxy parameters for a client's current circuit
pub fn proxy_params(client: &Client) -> ProxyParams {
    let circuit = client.circuit();
    match circuit.socks_agent_options() {
        Some(options) => ProxyParams::Socks(options),
        None => ProxyParams::Url(circuit.proxy_url()),
    }
}

/// A request completed through this client
pub fn handle_request_success(client: &Client) {
    if client.is_polling() {
        client.circuit().promote_health(POLL_HEAL_AMOUNT);
    }
}

/// A request failed through this client: classify, drive rotation or a
/// daemon restart as called for, and hand the decision back to the engine.
pub async fn handle_request_failure(
    client: &Client,
    message: &str,
    attempts: u32,
) -> Result<RetryDecision> {
    let circuit = client.circuit();
    let decision = retry_decision(message, attempts, circuit.is_local_daemon());

    if client.is_polling() && attempts > POLL_FAILURE_THRESHOLD {
        circuit.degrade_health(POLL_DEGRADE_AMOUNT);
    }

    if decision.restart_daemon {
        warn!(
            circuit = %circuit.display_identifier(),
            attempts, "TTL-expired storm, restarting the daemon"
        );
        client.coordinator()?.force_restart().await?;
    } else if decision.rotate {
        debug!(
            circuit = %circuit.display_identifier(),
            attempts, "rotating exit after failure: {}", message
        );
        client.force_ip_change().await?;
    }

    Ok(decision)
}
