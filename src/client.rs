//! User-facing client handles
//!
//! A client is bound to one circuit at a time. Ordinary clients can be
//! rebound when their circuit is removed or rotated; the polling flavor is
//! bound to its circuit forever and never rotates anything.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::circuit::{Circuit, CircuitKind, SocksAgentOptions};
use crate::coordinator::Coordinator;
use crate::error::{GiroError, Result};

/// Handle for issuing rate-limited actions through a circuit
#[derive(Debug)]
pub struct Client {
    coordinator: Weak<Coordinator>,
    circuit: RwLock<Arc<Circuit>>,
    polling: bool,
}

impl Client {
    pub(crate) fn new(
        coordinator: &Arc<Coordinator>,
        circuit: Arc<Circuit>,
        polling: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            coordinator: Arc::downgrade(coordinator),
            circuit: RwLock::new(circuit),
            polling,
        })
    }

    pub(crate) fn coordinator(&self) -> Result<Arc<Coordinator>> {
        self.coordinator
            .upgrade()
            .ok_or_else(|| GiroError::Internal("coordinator dropped".to_string()))
    }

    /// The circuit this client is currently bound to
    pub fn circuit(&self) -> Arc<Circuit> {
        self.circuit.read().clone()
    }

    /// Polling clients are hidden observers that never rebind
    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub(crate) fn rebind(&self, circuit: Arc<Circuit>) {
        if self.polling {
            debug!("rebind ignored on a polling client");
            return;
        }
        debug!(
            to = %circuit.display_identifier(),
            "client rebound"
        );
        *self.circuit.write() = circuit;
    }

    /// Exit IP the bound circuit currently presents
    pub fn current_ip(&self) -> Option<String> {
        self.circuit().active_exit_ip()
    }

    /// SOCKS connection parameters of the bound circuit, when applicable
    pub fn socks_agent_options(&self) -> Option<SocksAgentOptions> {
        self.circuit().socks_agent_options()
    }

    fn reject_rigid(&self) -> Result<()> {
        if self.circuit().kind() == CircuitKind::Rigid {
            return Err(GiroError::RigidCircuitMisuse);
        }
        Ok(())
    }

    /// Rotate this client's exit: onion circuits change their exit through
    /// the daemon, cycling circuits rebind to another pool member, and
    /// rigid circuits stay put by configuration. Inert on polling clients.
    pub async fn force_ip_change(&self) -> Result<()> {
        if self.polling {
            debug!("force change ignored on a polling client");
            return Ok(());
        }
        self.coordinator()?.force_change(self).await
    }

    /// Returns false when the current exit still has room for `action`;
    /// otherwise drives (or joins) an exit change and returns true.
    pub async fn probe_or_change(&self, action: &str) -> Result<bool> {
        self.reject_rigid()?;
        self.coordinator()?.probe_or_change(self, action).await
    }

    /// Record one occurrence of `action` against the current exit IP
    pub fn report_action(&self, action: &str) -> Result<()> {
        self.reject_rigid()?;
        self.coordinator()?.report_action(action, &self.circuit())
    }

    /// Observe the exit IP through the bound circuit (polling clients)
    pub(crate) async fn probe_exit_ip(&self) -> Result<String> {
        let circuit = self.circuit();
        self.coordinator()?.probe_circuit_ip(&circuit).await
    }
}
