//! Per-circuit pollers
//!
//! One poller task per circuit, running for as long as the circuit is
//! valid. Pollers are strictly observers: they report exit IP changes to
//! the coordinator and never rotate their own circuit. A companion heal
//! task restores health on a fixed cadence.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::circuit::{now_ms, Circuit, POLL_DEGRADE_AMOUNT, POLL_HEAL_AMOUNT};
use crate::client::Client;
use crate::coordinator::Coordinator;

/// Re-check interval while an IP change or daemon restart is in flight
pub const GATE_DEFER: Duration = Duration::from_secs(1);

/// Spawn the poll loop for a circuit
pub(crate) fn spawn(
    coordinator: Weak<Coordinator>,
    circuit: Arc<Circuit>,
    polling_client: Arc<Client>,
) -> JoinHandle<()> {
    tokio::spawn(run(coordinator, circuit, polling_client))
}

async fn run(coordinator: Weak<Coordinator>, circuit: Arc<Circuit>, polling_client: Arc<Client>) {
    debug!(circuit = %circuit.display_identifier(), "poller started");

    loop {
        // The exit IP was probed when the circuit was registered, so each
        // tick sleeps first and probes after.
        sleep(circuit.poll_interval()).await;

        // Never probe under the gate; an in-flight change owns the circuit.
        loop {
            if !circuit.valid() {
                debug!(circuit = %circuit.display_identifier(), "poller stopped");
                return;
            }
            match coordinator.upgrade() {
                Some(coordinator) if coordinator.gates_active() => {
                    drop(coordinator);
                    sleep(GATE_DEFER).await;
                }
                Some(_) => break,
                None => return,
            }
        }

        let Some(coordinator) = coordinator.upgrade() else {
            return;
        };

        match polling_client.probe_exit_ip().await {
            Ok(observed) => {
                circuit.promote_health(POLL_HEAL_AMOUNT);
                let current = circuit.active_exit_ip();
                if current.as_deref() != Some(observed.as_str()) {
                    debug!(
                        circuit = %circuit.display_identifier(),
                        from = current.as_deref().unwrap_or("-"),
                        to = %observed,
                        "unrequested exit IP change observed"
                    );
                    if let Err(e) = coordinator.on_observed_ip_change(&circuit, &observed).await {
                        warn!(
                            circuit = %circuit.display_identifier(),
                            "failed to absorb observed IP change: {}", e
                        );
                    }
                    // on_changed_ip stamped the poll time for us
                } else {
                    circuit.stamp_last_poll(now_ms());
                }
            }
            Err(e) => {
                warn!(
                    circuit = %circuit.display_identifier(),
                    "exit IP poll failed: {}", e
                );
                circuit.degrade_health(POLL_DEGRADE_AMOUNT);
            }
        }

        drop(coordinator);
    }
}

/// Spawn the periodic heal task for a circuit
pub(crate) fn spawn_healer(circuit: Arc<Circuit>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(circuit.heal_interval()).await;
            if !circuit.valid() {
                break;
            }
            circuit.promote_health(circuit.heal_amount());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitConfig;

    #[tokio::test]
    async fn test_healer_promotes_until_invalidated() {
        let config = CircuitConfig {
            heal_interval_ms: 10,
            heal_amount_per_interval: 5,
            ..CircuitConfig::default()
        };
        let circuit = Arc::new(Circuit::from_config(&config));
        circuit.degrade_health(50);

        let handle = spawn_healer(circuit.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(circuit.health() > 50);

        circuit.invalidate();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.await.unwrap();
    }
}
