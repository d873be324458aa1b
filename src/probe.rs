//! Exit IP discovery
//!
//! Each probe issues a GET through the circuit being inspected and extracts
//! the first IPv4 dotted quad from the response body.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};

use crate::circuit::Circuit;
use crate::error::{GiroError, Result};

/// Attempts per probe; pollers must not crash the process on a circuit
/// that fails indefinitely
pub const PROBE_ATTEMPTS: u32 = 4;

/// Spacing between probe attempts after a transport failure
pub const PROBE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Backoff range when the endpoint answered without an address in the body
pub const BODY_RETRY_SECS: std::ops::Range<u64> = 10..40;

fn ipv4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("valid regex"))
}

/// Extract the first IPv4 dotted quad from a response body
pub fn extract_ip(body: &str) -> Option<String> {
    ipv4_regex().find(body).map(|m| m.as_str().to_string())
}

/// Discovers the exit IP a circuit currently presents
#[async_trait]
pub trait ExitIpProbe: Send + Sync {
    async fn exit_ip(&self, circuit: &Circuit) -> Result<String>;
}

/// HTTP probe against a configured echo endpoint
pub struct HttpProber {
    url: String,
    attempts: u32,
    retry_delay: Duration,
    request_timeout: Duration,
}

impl HttpProber {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            attempts: PROBE_ATTEMPTS,
            retry_delay: PROBE_RETRY_DELAY,
            request_timeout: Duration::from_secs(10),
        }
    }

    fn client_for(&self, circuit: &Circuit) -> Result<reqwest::Client> {
        let proxy = reqwest::Proxy::all(circuit.proxy_url())?;
        Ok(reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.request_timeout)
            .build()?)
    }
}

#[async_trait]
impl ExitIpProbe for HttpProber {
    async fn exit_ip(&self, circuit: &Circuit) -> Result<String> {
        let client = self.client_for(circuit)?;
        let mut last_failure = String::from("exhausted probe attempts");

        for attempt in 1..=self.attempts {
            let backoff = match client.get(&self.url).send().await {
                Ok(response) => match response.text().await {
                    Ok(body) => {
                        if let Some(ip) = extract_ip(&body) {
                            debug!(
                                circuit = %circuit.display_identifier(),
                                ip, "observed exit IP"
                            );
                            return Ok(ip);
                        }
                        warn!(
                            circuit = %circuit.display_identifier(),
                            "probe response carried no address"
                        );
                        last_failure = "no address in response body".to_string();
                        let secs = rand::thread_rng().gen_range(BODY_RETRY_SECS);
                        Duration::from_secs(secs)
                    }
                    Err(e) => {
                        last_failure = e.to_string();
                        self.retry_delay
                    }
                },
                Err(e) => {
                    debug!(
                        circuit = %circuit.display_identifier(),
                        attempt, "probe request failed: {}", e
                    );
                    last_failure = e.to_string();
                    self.retry_delay
                }
            };

            if attempt < self.attempts {
                tokio::time::sleep(backoff).await;
            }
        }

        Err(GiroError::ProbeFailed(last_failure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_ip_finds_dotted_quad() {
        assert_eq!(extract_ip("93.184.216.34"), Some("93.184.216.34".to_string()));
        assert_eq!(
            extract_ip("your address is 10.0.0.1, enjoy"),
            Some("10.0.0.1".to_string())
        );
        assert_eq!(
            extract_ip("<html><body>185.220.101.4</body></html>"),
            Some("185.220.101.4".to_string())
        );
    }

    #[test]
    fn test_extract_ip_rejects_non_addresses() {
        assert_eq!(extract_ip(""), None);
        assert_eq!(extract_ip("no address here"), None);
        assert_eq!(extract_ip("1.2.3"), None);
        assert_eq!(extract_ip("version 1.2.3.4.5 is fine"), Some("1.2.3.4".to_string()));
    }

    #[test]
    fn test_extract_ip_takes_first_match() {
        assert_eq!(
            extract_ip("10.0.0.1 then 10.0.0.2"),
            Some("10.0.0.1".to_string())
        );
    }
}
