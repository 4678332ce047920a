//! Network and visibility gate.
//!
//! The host feeds two booleans into the engine: whether the network is
//! reachable and whether the application is focused. Pipelines and mutation
//! runners read the current values and suspend on the next transition to
//! `true`.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::debug;

/// Whether executions wait for the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Executions pause while offline and resume on reconnect.
    #[default]
    Online,
    /// Executions run regardless of connectivity.
    Always,
}

/// Shared handle over the two host signals.
///
/// Cloning is cheap; every clone observes and feeds the same signals.
#[derive(Debug, Clone)]
pub struct NetworkGate {
    online: Arc<watch::Sender<bool>>,
    focused: Arc<watch::Sender<bool>>,
}

impl NetworkGate {
    pub fn new(online: bool, focused: bool) -> Self {
        Self {
            online: Arc::new(watch::Sender::new(online)),
            focused: Arc::new(watch::Sender::new(focused)),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn is_focused(&self) -> bool {
        *self.focused.borrow()
    }

    /// Report a connectivity change from the host. Repeated values are ignored.
    pub fn set_online(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            debug!(online, "Network state changed");
        }
    }

    /// Report a focus change from the host. Repeated values are ignored.
    pub fn set_focused(&self, focused: bool) {
        let changed = self.focused.send_if_modified(|current| {
            let changed = *current != focused;
            *current = focused;
            changed
        });
        if changed {
            debug!(focused, "Focus state changed");
        }
    }

    /// Receiver over the online signal, for select loops.
    pub fn online_signal(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Receiver over the focus signal, for select loops.
    pub fn focus_signal(&self) -> watch::Receiver<bool> {
        self.focused.subscribe()
    }

    /// Resolve once the network is reachable; immediately if it already is.
    pub async fn wait_for_online(&self) {
        let mut signal = self.online.subscribe();
        // The sender lives as long as `self`, so this only fails if the gate is gone.
        let _ = signal.wait_for(|online| *online).await;
    }

    /// Resolve once the host is focused; immediately if it already is.
    pub async fn wait_for_focus(&self) {
        let mut signal = self.focused.subscribe();
        let _ = signal.wait_for(|focused| *focused).await;
    }

    /// Whether an execution in `mode` must wait before running.
    pub fn must_wait(&self, mode: NetworkMode) -> bool {
        mode == NetworkMode::Online && !self.is_online()
    }
}

impl Default for NetworkGate {
    fn default() -> Self {
        Self::new(true, true)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn wait_for_online_resolves_immediately_when_online() {
        let gate = NetworkGate::default();
        tokio::time::timeout(Duration::from_millis(50), gate.wait_for_online())
            .await
            .expect("already online");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_online_resumes_on_transition() {
        let gate = NetworkGate::new(false, true);
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait_for_online().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.set_online(true);
        waiter.await.expect("waiter completes");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_focus_resumes_on_transition() {
        let gate = NetworkGate::new(true, false);
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait_for_focus().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.set_focused(true);
        waiter.await.expect("waiter completes");
        assert!(gate.is_focused());
    }

    #[test]
    fn repeated_values_do_not_notify() {
        let gate = NetworkGate::new(true, true);
        let mut signal = gate.online_signal();
        signal.mark_unchanged();

        gate.set_online(true);
        assert!(!signal.has_changed().expect("sender alive"));

        gate.set_online(false);
        assert!(signal.has_changed().expect("sender alive"));
    }

    #[test]
    fn always_mode_never_waits() {
        let gate = NetworkGate::new(false, true);
        assert!(gate.must_wait(NetworkMode::Online));
        assert!(!gate.must_wait(NetworkMode::Always));
    }
}
