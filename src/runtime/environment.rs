use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;
use crate::runtime::constraint::{Environment, NetworkState};

/// Holds the current [`Environment`] and wakes every waiter when it changes.
/// Blocked tasks park on [`EnvironmentMonitor::subscribe`] instead of polling.
#[derive(Debug)]
pub struct EnvironmentMonitor {
    tx: watch::Sender<Environment>,
}

impl EnvironmentMonitor {
    pub fn new(initial: Environment) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn snapshot(&self) -> Environment {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Environment> {
        self.tx.subscribe()
    }

    /// Applies `f` and notifies waiters. Waiters are woken even if `f` left the
    /// snapshot unchanged; they simply re-evaluate.
    pub fn update(&self, f: impl FnOnce(&mut Environment)) {
        self.tx.send_modify(f);
        debug!(environment = ?*self.tx.borrow(), "Environment changed");
    }

    pub fn replace(&self, env: Environment) {
        self.update(|current| *current = env);
    }

    pub fn set_charging(&self, charging: bool) {
        self.update(|env| env.charging = charging);
    }

    pub fn set_device_idle(&self, idle: bool) {
        self.update(|env| env.device_idle = idle);
    }

    pub fn set_battery_not_low(&self, ok: bool) {
        self.update(|env| env.battery_not_low = ok);
    }

    pub fn set_storage_not_low(&self, ok: bool) {
        self.update(|env| env.storage_not_low = ok);
    }

    pub fn set_network(&self, network: NetworkState) {
        self.update(|env| env.network = network);
    }

    pub fn set_var(&self, key: &str, value: Value) {
        self.update(|env| {
            env.vars.insert(key.to_string(), value);
        });
    }
}

impl Default for EnvironmentMonitor {
    fn default() -> Self {
        Self::new(Environment::default())
    }
}
