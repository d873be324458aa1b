//! IP-change coordination
//!
//! The coordinator is the single-flight arbiter for exit IP changes. It
//! owns the `changing` and `restarting` gates, the FIFO waiter queue, the
//! rate store, the circuit pool, and the daemon supervisor, and ties
//! action accounting, health, and IP changes together.
//!
//! Gate discipline: a caller that wants to change an IP first observes
//! `changing`. If set, it enqueues a one-shot waiter and suspends until the
//! in-flight change completes, then returns as if it had driven the change
//! itself. If clear, it sets the gate and drives.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::circuit::{now_ms, Circuit, CircuitKind};
use crate::client::Client;
use crate::config::{CircuitConfig, ManagerConfig};
use crate::daemon::{DaemonSupervisor, ProcessControl, SystemProcessControl};
use crate::error::{GiroError, Result};
use crate::pool::CircuitPool;
use crate::probe::{ExitIpProbe, HttpProber};
use crate::rate::{RateStore, UNATTRIBUTED_IP};
use crate::poller;

/// How a new client picks its circuit
#[derive(Debug, Clone)]
pub enum ClientSpec {
    /// A random healthy member of the cycling pool
    Random,
    /// A cycling pool position
    Index(usize),
    /// A circuit name
    Named(String),
}

impl Default for ClientSpec {
    fn default() -> Self {
        ClientSpec::Random
    }
}

impl From<usize> for ClientSpec {
    fn from(index: usize) -> Self {
        ClientSpec::Index(index)
    }
}

impl From<&str> for ClientSpec {
    fn from(name: &str) -> Self {
        ClientSpec::Named(name.to_string())
    }
}

impl std::fmt::Display for ClientSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientSpec::Random => write!(f, "any cycling circuit"),
            ClientSpec::Index(index) => write!(f, "cycling circuit #{}", index),
            ClientSpec::Named(name) => write!(f, "circuit named {:?}", name),
        }
    }
}

#[derive(Default)]
struct ChangeGate {
    changing: bool,
    restarting: bool,
    waiters: Vec<oneshot::Sender<bool>>,
}

enum GateEntry {
    /// The caller owns the gate and must drive the change
    Acquired,
    /// A change is in flight; await the receiver
    Waiting(oneshot::Receiver<bool>),
}

/// The single-flight arbiter tying circuits, rates, and the daemon together
pub struct Coordinator {
    config: ManagerConfig,
    pool: CircuitPool,
    rate: Mutex<RateStore>,
    gate: Mutex<ChangeGate>,
    clients: Mutex<Vec<Arc<Client>>>,
    supervisor: DaemonSupervisor,
    prober: Arc<dyn ExitIpProbe>,
}

impl Coordinator {
    /// Build a coordinator against the real process table and HTTP prober,
    /// loading any persisted rate cache from disk.
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let prober = Arc::new(HttpProber::new(config.probe_url.clone()));
        Self::with_parts(config, prober, Arc::new(SystemProcessControl))
    }

    /// Build a coordinator with substituted probe/process implementations
    pub fn with_parts(
        config: ManagerConfig,
        prober: Arc<dyn ExitIpProbe>,
        control: Arc<dyn ProcessControl>,
    ) -> Arc<Self> {
        let mut rate = RateStore::new(config.compact_threshold, config.blacklist.clone());
        rate.load_from_path(&config.cache_path);

        let supervisor = DaemonSupervisor::new(
            control,
            config.daemon_command.clone(),
            config.startup_grace,
        );

        Arc::new(Self {
            config,
            pool: CircuitPool::new(),
            rate: Mutex::new(rate),
            gate: Mutex::new(ChangeGate::default()),
            clients: Mutex::new(Vec::new()),
            supervisor,
            prober,
        })
    }

    pub fn pool(&self) -> &CircuitPool {
        &self.pool
    }

    /// True while an IP change or daemon restart is in flight
    pub fn gates_active(&self) -> bool {
        let gate = self.gate.lock();
        gate.changing || gate.restarting
    }

    /// Register (or overwrite) a named action and its rolling-window limit
    pub fn register_action(&self, name: &str, limit: usize, window_ms: Option<i64>) {
        self.rate.lock().register_action(name, limit, window_ms);
    }

    /// Refuse an exit IP outright, independent of any counts
    pub fn blacklist_ip(&self, ip: &str) {
        self.rate.lock().blacklist_ip(ip);
    }

    /// Install the override for the all-circuits-unhealthy condition
    pub fn set_all_unhealthy_hook(&self, hook: crate::pool::AllUnhealthyHook) {
        self.pool.set_all_unhealthy_hook(hook);
    }

    /// Register a circuit: validate, start the daemon when needed, probe
    /// the exit IP, insert into the pool, and launch its poller. Adds are
    /// expected to be submitted sequentially.
    pub async fn add_circuit(self: &Arc<Self>, config: CircuitConfig) -> Result<Arc<Circuit>> {
        let circuit = Arc::new(Circuit::from_config(&config));
        self.pool.check_addable(&circuit)?;

        if circuit.is_local_daemon() {
            let was_running = self.supervisor.start_if_not_running().await?;
            if was_running {
                debug!("daemon already up for new onion circuit");
            }
        }

        let polling_client = Client::new(self, circuit.clone(), true);
        let ip = polling_client.probe_exit_ip().await?;
        self.on_changed_ip(&circuit, &ip)?;
        self.pool.add(circuit.clone())?;
        info!(
            circuit = %circuit.display_identifier(),
            ip = %ip,
            "circuit registered"
        );

        poller::spawn(Arc::downgrade(self), circuit.clone(), polling_client);
        poller::spawn_healer(circuit.clone());

        Ok(circuit)
    }

    /// Drop a circuit: invalidate it, rebind its clients to other cycling
    /// circuits, and tear the daemon down when the last onion circuit goes.
    pub async fn remove_circuit(&self, circuit: &Arc<Circuit>) -> Result<()> {
        self.pool.remove(circuit);
        info!(circuit = %circuit.display_identifier(), "circuit removed");

        let bound: Vec<Arc<Client>> = self
            .clients
            .lock()
            .iter()
            .filter(|client| Arc::ptr_eq(&client.circuit(), circuit))
            .cloned()
            .collect();
        for client in bound {
            match self.pool.select_random(Some(circuit), true)? {
                Some(replacement) => client.rebind(replacement),
                None => warn!(
                    circuit = %circuit.display_identifier(),
                    "no replacement circuit for a client of a removed circuit"
                ),
            }
        }

        if circuit.is_local_daemon() && self.pool.onion_circuits().is_empty() {
            debug!("last onion circuit removed, tearing daemon down");
            self.supervisor.kill_all().await?;
        }
        Ok(())
    }

    /// Create a client bound to the circuit the spec resolves to
    pub fn create_client(self: &Arc<Self>, spec: ClientSpec) -> Result<Arc<Client>> {
        let circuit = match &spec {
            ClientSpec::Random => self.pool.select_random(None, true)?,
            ClientSpec::Index(index) => self.pool.by_index(*index),
            ClientSpec::Named(name) => self.pool.by_name(name),
        }
        .ok_or_else(|| GiroError::NoCircuitFound {
            spec: spec.to_string(),
        })?;

        let client = Client::new(self, circuit, false);
        self.clients.lock().push(client.clone());
        Ok(client)
    }

    /// Record one occurrence of `action` against the circuit's current
    /// exit IP. Deliberately not gated by `changing`: an action racing an
    /// IP change lands on whichever IP is current at record time, and the
    /// ambiguous-window copy compensates.
    pub fn report_action(&self, action: &str, circuit: &Circuit) -> Result<()> {
        let ip = circuit
            .active_exit_ip()
            .unwrap_or_else(|| UNATTRIBUTED_IP.to_string());
        self.rate.lock().record_action(&ip, action)
    }

    /// Returns false when the circuit's exit still has room for `action`;
    /// otherwise drives (or joins) an exit change and returns true.
    pub async fn probe_or_change(self: &Arc<Self>, client: &Client, action: &str) -> Result<bool> {
        if let Some(receiver) = self.join_in_flight() {
            return Ok(receiver.await.unwrap_or(true));
        }

        let circuit = client.circuit();
        let ip = circuit
            .active_exit_ip()
            .unwrap_or_else(|| UNATTRIBUTED_IP.to_string());
        if self.rate.lock().is_available(&ip, action)? {
            return Ok(false);
        }

        debug!(
            circuit = %circuit.display_identifier(),
            ip = %ip,
            action,
            "exit exhausted, changing"
        );
        self.force_change(client).await?;
        Ok(true)
    }

    /// Rotate the client's exit, skipping any availability check.
    ///
    /// Onion circuits change their exit through the daemon under the gate;
    /// cycling circuits rebind the caller to another pool member; rigid
    /// circuits stay put by configuration.
    pub async fn force_change(self: &Arc<Self>, client: &Client) -> Result<()> {
        let circuit = client.circuit();
        match circuit.kind() {
            CircuitKind::Onion => match self.enter_change_gate() {
                GateEntry::Waiting(receiver) => {
                    let _ = receiver.await;
                    Ok(())
                }
                GateEntry::Acquired => {
                    let result = self.definitively_change_to_available_ip(&circuit).await;
                    if result.is_err() {
                        self.abort_change();
                    }
                    result
                }
            },
            CircuitKind::Cycling => {
                if client.is_polling() {
                    debug!("force change ignored on a polling client");
                    return Ok(());
                }
                match self.pool.select_random(Some(&circuit), true)? {
                    Some(replacement) if !Arc::ptr_eq(&replacement, &circuit) => {
                        client.rebind(replacement);
                    }
                    Some(_) => warn!(
                        circuit = %circuit.display_identifier(),
                        "no better circuit available, staying put"
                    ),
                    None => warn!(
                        circuit = %circuit.display_identifier(),
                        "cycling pool offered no replacement"
                    ),
                }
                Ok(())
            }
            CircuitKind::Rigid => {
                warn!(
                    circuit = %circuit.display_identifier(),
                    "rigid circuit cannot rotate, ignoring force change"
                );
                Ok(())
            }
        }
    }

    /// Absorb an exit IP change the poller observed without anyone asking
    /// for it. Trailing action timestamps newer than the previous poll are
    /// copied onto the new IP as well as the old one: across the race
    /// window the actions may have left through either exit, so both are
    /// charged. The rate cache is persisted here to bound data loss.
    pub async fn on_observed_ip_change(
        self: &Arc<Self>,
        circuit: &Arc<Circuit>,
        new_ip: &str,
    ) -> Result<()> {
        if new_ip.is_empty() {
            return Err(GiroError::MissingIp {
                identifier: circuit.display_identifier(),
            });
        }
        self.gate.lock().changing = true;

        let snapshot = {
            let mut rate = self.rate.lock();
            rate.ensure_ip(new_ip);
            if let Some(old_ip) = circuit.active_exit_ip() {
                rate.copy_ambiguous(&old_ip, new_ip, circuit.last_poll_ms());
            }
            rate.serialize()
        };
        match snapshot {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&self.config.cache_path, json).await {
                    warn!(
                        path = %self.config.cache_path.display(),
                        "failed to persist rate cache: {}", e
                    );
                }
            }
            Err(e) => warn!("failed to serialize rate cache: {}", e),
        }

        self.on_changed_ip(circuit, new_ip)
    }

    /// Commit a completed IP change: assign the IP, stamp the poll time,
    /// clear the gates, fan the waiter queue out in FIFO order, and compact
    /// the rate cache when it has grown past its threshold.
    pub fn on_changed_ip(&self, circuit: &Circuit, new_ip: &str) -> Result<()> {
        if new_ip.is_empty() {
            return Err(GiroError::MissingIp {
                identifier: circuit.display_identifier(),
            });
        }

        circuit.set_active_exit_ip(Some(new_ip.to_string()));
        circuit.stamp_last_poll(now_ms());
        debug!(
            circuit = %circuit.display_identifier(),
            ip = %new_ip,
            "exit IP committed"
        );

        self.release_waiters(true);

        let live = self.pool.active_exit_ips();
        self.rate.lock().compact(&live);
        Ok(())
    }

    /// The retry loop behind a requested change on an onion circuit. The
    /// caller holds the gate. Success is an observed IP that differs from
    /// the pre-change one; whether the new exit has room for any given
    /// action is the next `probe_or_change`'s problem.
    async fn definitively_change_to_available_ip(&self, circuit: &Arc<Circuit>) -> Result<()> {
        let pre_change_ip = circuit.active_exit_ip();

        for attempt in 1..=self.config.max_change_tries {
            self.supervisor.rotate_exit().await?;

            let observed = match self.prober.exit_ip(circuit).await {
                Ok(ip) => ip,
                Err(e) => {
                    warn!(
                        circuit = %circuit.display_identifier(),
                        attempt, "probe after rotation failed: {}", e
                    );
                    continue;
                }
            };

            if pre_change_ip.as_deref() != Some(observed.as_str()) {
                return self.on_changed_ip(circuit, &observed);
            }
            debug!(
                circuit = %circuit.display_identifier(),
                attempt,
                ip = %observed,
                "exit IP unchanged after rotation"
            );
        }

        Err(GiroError::IpChangeExhausted {
            attempts: self.config.max_change_tries,
        })
    }

    /// Kill and respawn the daemon outright, then re-absorb every onion
    /// circuit's exit IP. Single-flight via the `restarting` gate; callers
    /// that arrive mid-restart wait it out.
    pub async fn force_restart(self: &Arc<Self>) -> Result<()> {
        let waiter = {
            let mut gate = self.gate.lock();
            if gate.restarting {
                let (sender, receiver) = oneshot::channel();
                gate.waiters.push(sender);
                Some(receiver)
            } else {
                gate.restarting = true;
                gate.changing = true;
                None
            }
        };
        if let Some(receiver) = waiter {
            let _ = receiver.await;
            return Ok(());
        }

        info!("force-restarting the daemon");
        let result = self.restart_and_reabsorb().await;
        if result.is_err() {
            self.abort_change();
        }
        result
    }

    async fn restart_and_reabsorb(self: &Arc<Self>) -> Result<()> {
        self.supervisor.kill_all().await?;
        self.supervisor.start_if_not_running().await?;

        let onion_circuits = self.pool.onion_circuits();
        if onion_circuits.is_empty() {
            warn!("daemon restarted with no onion circuits to re-absorb");
            self.release_waiters(true);
            return Ok(());
        }

        // Each absorption clears the gates and wakes the waiters queued so
        // far; later circuits re-enter the changing state on their own.
        for circuit in onion_circuits {
            let ip = self.prober.exit_ip(&circuit).await?;
            self.on_observed_ip_change(&circuit, &ip).await?;
        }
        Ok(())
    }

    /// Observe the exit IP a circuit currently presents
    pub(crate) async fn probe_circuit_ip(&self, circuit: &Circuit) -> Result<String> {
        self.prober.exit_ip(circuit).await
    }

    fn enter_change_gate(&self) -> GateEntry {
        let mut gate = self.gate.lock();
        if gate.changing {
            let (sender, receiver) = oneshot::channel();
            gate.waiters.push(sender);
            GateEntry::Waiting(receiver)
        } else {
            gate.changing = true;
            GateEntry::Acquired
        }
    }

    /// Join an in-flight change without ever acquiring the gate
    fn join_in_flight(&self) -> Option<oneshot::Receiver<bool>> {
        let mut gate = self.gate.lock();
        if !gate.changing {
            return None;
        }
        let (sender, receiver) = oneshot::channel();
        gate.waiters.push(sender);
        Some(receiver)
    }

    /// Clear the gates and resolve every queued waiter, oldest first
    fn release_waiters(&self, changed: bool) {
        let waiters = {
            let mut gate = self.gate.lock();
            gate.changing = false;
            gate.restarting = false;
            std::mem::take(&mut gate.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(changed);
        }
    }

    /// Failure path: unblock everyone with "nothing changed"
    fn abort_change(&self) {
        self.release_waiters(false);
    }

    #[cfg(test)]
    pub(crate) fn rate_store(&self) -> &Mutex<RateStore> {
        &self.rate
    }
}
