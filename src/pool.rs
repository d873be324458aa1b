//! Circuit pool
//!
//! Live circuits are split into a cycling pool, eligible for random
//! selection, and a named registry reachable only by explicit name.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::warn;

use crate::circuit::Circuit;
use crate::error::{GiroError, Result};

/// Invoked when every cycling circuit is unhealthy; installing one
/// overrides the default fatal behavior.
pub type AllUnhealthyHook = Box<dyn Fn() + Send + Sync>;

/// The set of live circuits
#[derive(Default)]
pub struct CircuitPool {
    cycling: RwLock<Vec<Arc<Circuit>>>,
    named: RwLock<HashMap<String, Arc<Circuit>>>,
    all_unhealthy: RwLock<Option<AllUnhealthyHook>>,
}

impl CircuitPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the fatal default for the all-circuits-unhealthy condition
    pub fn set_all_unhealthy_hook(&self, hook: AllUnhealthyHook) {
        *self.all_unhealthy.write() = Some(hook);
    }

    fn validate(&self, circuit: &Circuit) -> Result<()> {
        if !circuit.in_cycling_pool() && circuit.name().is_none() {
            return Err(GiroError::UnnamedRigidCircuit);
        }
        let identifier = circuit.identifier();
        let duplicate = self
            .cycling
            .read()
            .iter()
            .any(|c| c.identifier() == identifier)
            || self
                .named
                .read()
                .values()
                .any(|c| c.identifier() == identifier);
        if duplicate {
            return Err(GiroError::DuplicateCircuit { identifier });
        }
        Ok(())
    }

    /// Pre-validate a circuit that will be added once its exit IP is known
    pub fn check_addable(&self, circuit: &Circuit) -> Result<()> {
        self.validate(circuit)
    }

    /// Insert a circuit into the collection its flags indicate
    pub fn add(&self, circuit: Arc<Circuit>) -> Result<()> {
        self.validate(&circuit)?;
        if circuit.in_cycling_pool() {
            self.cycling.write().push(circuit);
        } else {
            // validate() guarantees a name here
            let name = circuit.name().unwrap_or_default().to_string();
            self.named.write().insert(name, circuit);
        }
        Ok(())
    }

    /// Mark a circuit invalid and drop it from its collection
    pub fn remove(&self, circuit: &Arc<Circuit>) {
        circuit.invalidate();
        if circuit.in_cycling_pool() {
            let mut cycling = self.cycling.write();
            let before = cycling.len();
            cycling.retain(|c| !Arc::ptr_eq(c, circuit));
            if cycling.len() == before {
                warn!(
                    circuit = %circuit.display_identifier(),
                    "removal requested for a circuit not in the cycling pool"
                );
            }
        } else if let Some(name) = circuit.name() {
            if self.named.write().remove(name).is_none() {
                warn!(
                    circuit = %circuit.display_identifier(),
                    "removal requested for an unregistered named circuit"
                );
            }
        }
    }

    /// Choose uniformly at random from the cycling pool
    ///
    /// With a pool of one or zero entries no exclusion or health filtering
    /// applies. When everything is unhealthy the all-unhealthy hook fires
    /// (default: error); a healthy `exclude` is returned when it is the
    /// only healthy circuit left, since staying put beats moving to a
    /// known-bad exit.
    pub fn select_random(
        &self,
        exclude: Option<&Arc<Circuit>>,
        skip_unhealthy: bool,
    ) -> Result<Option<Arc<Circuit>>> {
        let candidates: Vec<Arc<Circuit>> = {
            let cycling = self.cycling.read();
            if cycling.len() <= 1 {
                warn!(
                    size = cycling.len(),
                    "cycling pool too small for real selection"
                );
                return Ok(cycling.first().cloned());
            }
            cycling
                .iter()
                .filter(|c| exclude.map_or(true, |e| !Arc::ptr_eq(c, e)))
                .filter(|c| !skip_unhealthy || c.healthy())
                .cloned()
                .collect()
        };

        if candidates.is_empty() {
            if skip_unhealthy {
                if let Some(excluded) = exclude {
                    if excluded.healthy() {
                        warn!(
                            circuit = %excluded.display_identifier(),
                            "only healthy circuit is the excluded one, staying put"
                        );
                        return Ok(Some(excluded.clone()));
                    }
                }
                if let Some(hook) = self.all_unhealthy.read().as_ref() {
                    hook();
                    return Ok(None);
                }
                return Err(GiroError::AllCircuitsUnhealthy);
            }
            warn!("no selectable circuit in the cycling pool");
            return Ok(None);
        }

        Ok(candidates.choose(&mut rand::thread_rng()).cloned())
    }

    /// Exact lookup across the cycling pool and the named registry
    pub fn by_name(&self, name: &str) -> Option<Arc<Circuit>> {
        if let Some(circuit) = self
            .cycling
            .read()
            .iter()
            .find(|c| c.name() == Some(name))
        {
            return Some(circuit.clone());
        }
        self.named.read().get(name).cloned()
    }

    /// Index into the cycling pool
    pub fn by_index(&self, index: usize) -> Option<Arc<Circuit>> {
        self.cycling.read().get(index).cloned()
    }

    pub fn cycling_count(&self) -> usize {
        self.cycling.read().len()
    }

    /// Every live circuit, cycling and named
    pub fn all_circuits(&self) -> Vec<Arc<Circuit>> {
        let mut circuits: Vec<Arc<Circuit>> = self.cycling.read().iter().cloned().collect();
        circuits.extend(self.named.read().values().cloned());
        circuits
    }

    /// Live circuits routed through the supervised daemon
    pub fn onion_circuits(&self) -> Vec<Arc<Circuit>> {
        self.all_circuits()
            .into_iter()
            .filter(|c| c.is_local_daemon())
            .collect()
    }

    /// Exit IPs currently presented by live circuits
    pub fn active_exit_ips(&self) -> HashSet<String> {
        self.all_circuits()
            .iter()
            .filter_map(|c| c.active_exit_ip())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitConfig;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn circuit(port: u16) -> Arc<Circuit> {
        let config = CircuitConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..CircuitConfig::default()
        };
        Arc::new(Circuit::from_config(&config))
    }

    fn named_circuit(port: u16, name: &str, cycling: bool) -> Arc<Circuit> {
        let config = CircuitConfig {
            host: "127.0.0.1".to_string(),
            port,
            name: Some(name.to_string()),
            in_cycling_pool: cycling,
            ..CircuitConfig::default()
        };
        Arc::new(Circuit::from_config(&config))
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let pool = CircuitPool::new();
        pool.add(circuit(9050)).unwrap();
        let err = pool.add(circuit(9050)).unwrap_err();
        assert!(matches!(err, GiroError::DuplicateCircuit { .. }));
        assert_eq!(pool.cycling_count(), 1);
    }

    #[test]
    fn test_add_rejects_unnamed_rigid() {
        let pool = CircuitPool::new();
        let config = CircuitConfig {
            in_cycling_pool: false,
            ..CircuitConfig::default()
        };
        let err = pool
            .add(Arc::new(Circuit::from_config(&config)))
            .unwrap_err();
        assert!(matches!(err, GiroError::UnnamedRigidCircuit));
    }

    #[test]
    fn test_named_circuit_lands_in_registry() {
        let pool = CircuitPool::new();
        pool.add(named_circuit(9051, "pinned", false)).unwrap();
        assert_eq!(pool.cycling_count(), 0);
        assert!(pool.by_name("pinned").is_some());
        assert!(pool.select_random(None, true).unwrap().is_none());
    }

    #[test]
    fn test_by_name_finds_cycling_circuits_too() {
        let pool = CircuitPool::new();
        pool.add(named_circuit(9052, "fast", true)).unwrap();
        assert_eq!(pool.cycling_count(), 1);
        assert!(pool.by_name("fast").is_some());
        assert!(pool.by_name("slow").is_none());
    }

    #[test]
    fn test_select_random_empty_pool() {
        let pool = CircuitPool::new();
        assert!(pool.select_random(None, true).unwrap().is_none());
    }

    #[test]
    fn test_select_random_sole_entry_ignores_exclusion() {
        let pool = CircuitPool::new();
        let sole = circuit(9050);
        pool.add(sole.clone()).unwrap();

        let picked = pool.select_random(Some(&sole), true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&picked, &sole));
    }

    #[test]
    fn test_select_random_respects_exclusion() {
        let pool = CircuitPool::new();
        let a = circuit(9050);
        let b = circuit(9051);
        pool.add(a.clone()).unwrap();
        pool.add(b.clone()).unwrap();

        for _ in 0..20 {
            let picked = pool.select_random(Some(&a), true).unwrap().unwrap();
            assert!(Arc::ptr_eq(&picked, &b));
        }
    }

    #[test]
    fn test_select_random_skips_unhealthy() {
        let pool = CircuitPool::new();
        let a = circuit(9050);
        let b = circuit(9051);
        let c = circuit(9052);
        b.degrade_health(100);
        pool.add(a.clone()).unwrap();
        pool.add(b).unwrap();
        pool.add(c.clone()).unwrap();

        for _ in 0..20 {
            let picked = pool.select_random(None, true).unwrap().unwrap();
            assert!(Arc::ptr_eq(&picked, &a) || Arc::ptr_eq(&picked, &c));
        }
    }

    #[test]
    fn test_select_random_returns_healthy_exclude_over_unhealthy_rest() {
        let pool = CircuitPool::new();
        let a = circuit(9050);
        let b = circuit(9051);
        b.degrade_health(100);
        pool.add(a.clone()).unwrap();
        pool.add(b).unwrap();

        let picked = pool.select_random(Some(&a), true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&picked, &a));
    }

    #[test]
    fn test_select_random_all_unhealthy_is_fatal_by_default() {
        let pool = CircuitPool::new();
        let a = circuit(9050);
        let b = circuit(9051);
        a.degrade_health(100);
        b.degrade_health(100);
        pool.add(a).unwrap();
        pool.add(b).unwrap();

        let err = pool.select_random(None, true).unwrap_err();
        assert!(matches!(err, GiroError::AllCircuitsUnhealthy));
    }

    #[test]
    fn test_all_unhealthy_hook_overrides_fatal_default() {
        let pool = CircuitPool::new();
        let a = circuit(9050);
        let b = circuit(9051);
        a.degrade_health(100);
        b.degrade_health(100);
        pool.add(a).unwrap();
        pool.add(b).unwrap();

        static FIRED: AtomicBool = AtomicBool::new(false);
        pool.set_all_unhealthy_hook(Box::new(|| {
            FIRED.store(true, Ordering::SeqCst);
        }));

        assert!(pool.select_random(None, true).unwrap().is_none());
        assert!(FIRED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_remove_invalidates_and_drops() {
        let pool = CircuitPool::new();
        let a = circuit(9050);
        let pinned = named_circuit(9051, "pinned", false);
        pool.add(a.clone()).unwrap();
        pool.add(pinned.clone()).unwrap();

        pool.remove(&a);
        assert!(!a.valid());
        assert_eq!(pool.cycling_count(), 0);

        pool.remove(&pinned);
        assert!(!pinned.valid());
        assert!(pool.by_name("pinned").is_none());
    }

    #[test]
    fn test_active_exit_ips_collects_live_circuits() {
        let pool = CircuitPool::new();
        let a = circuit(9050);
        let pinned = named_circuit(9051, "pinned", false);
        a.set_active_exit_ip(Some("10.0.0.1".to_string()));
        pinned.set_active_exit_ip(Some("10.0.0.2".to_string()));
        pool.add(a).unwrap();
        pool.add(pinned).unwrap();

        let ips = pool.active_exit_ips();
        assert!(ips.contains("10.0.0.1"));
        assert!(ips.contains("10.0.0.2"));
    }
}
