//! Relay lifecycle orchestration.
//!
//! The manager owns a set of listeners and drives them through a
//! one-way lifecycle: not running, running, stopping, stopped. A
//! stopped manager is not restartable; build a fresh one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::factory::SessionFactory;
use crate::listener::{Listener, ListenerConfig};

/// Default interval between live-session polls while draining.
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Floor for drain sleeps so a near-expired deadline cannot spin.
const MIN_DRAIN_SLEEP: Duration = Duration::from_millis(10);

/// Where the manager is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotRunning,
    Running,
    Stopping,
    Stopped,
}

/// How to treat live sessions when stopping.
#[derive(Debug, Clone, Copy)]
pub enum StopMode {
    /// Force-close every session immediately.
    Immediate,
    /// Let sessions finish naturally, force-closing any that remain
    /// at the deadline. `None` waits indefinitely.
    Drain(Option<Duration>),
}

/// Owns listeners and coordinates startup and shutdown.
pub struct RelayManager {
    listeners: Mutex<Vec<Arc<Listener>>>,
    lifecycle: watch::Sender<LifecycleState>,
    poll_interval: Duration,
}

impl Default for RelayManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayManager {
    pub fn new() -> Self {
        let (lifecycle, _) = watch::channel(LifecycleState::NotRunning);
        Self {
            listeners: Mutex::new(Vec::new()),
            lifecycle,
            poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
        }
    }

    /// Override the drain poll interval. Mostly useful for tests that
    /// stop quickly.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    /// Bind a listener and register it with the manager. If the
    /// manager is already running, the listener starts accepting
    /// immediately; otherwise it waits for [`RelayManager::start`].
    pub async fn add_listener(
        &self,
        config: ListenerConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Arc<Listener>, RelayError> {
        let state = self.state();
        if matches!(state, LifecycleState::Stopping | LifecycleState::Stopped) {
            return Err(RelayError::Config(
                "cannot add a listener to a stopping or stopped relay".into(),
            ));
        }

        let listener = Arc::new(Listener::bind(config, factory).await?);
        self.listeners.lock().unwrap().push(Arc::clone(&listener));

        if self.state() == LifecycleState::Running {
            spawn_accept_loop(Arc::clone(&listener));
        }
        Ok(listener)
    }

    /// Unregister a listener and stop it accepting. Its live sessions
    /// keep running but are no longer tracked by this manager.
    pub fn remove_listener(&self, listener: &Arc<Listener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        let removed = listeners.len() != before;
        drop(listeners);
        if removed {
            listener.shutdown_accept();
        }
        removed
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Start accepting on every registered listener.
    ///
    /// Must be called from within a tokio runtime. Fails unless the
    /// manager has never been started.
    pub fn start(&self) -> Result<(), RelayError> {
        let mut transitioned = false;
        self.lifecycle.send_if_modified(|state| {
            if *state == LifecycleState::NotRunning {
                *state = LifecycleState::Running;
                transitioned = true;
                true
            } else {
                false
            }
        });
        if !transitioned {
            return Err(RelayError::Config("relay already started".into()));
        }

        let listeners = self.listeners.lock().unwrap().clone();
        info!(listeners = listeners.len(), "relay starting");
        for listener in listeners {
            spawn_accept_loop(listener);
        }
        Ok(())
    }

    /// Begin shutdown. Returns immediately; the drain runs in the
    /// background and [`RelayManager::wait_stopped`] observes its
    /// completion. A no-op unless the manager is running.
    pub fn stop(&self, mode: StopMode) {
        let mut transitioned = false;
        self.lifecycle.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::Stopping;
                transitioned = true;
                true
            } else {
                false
            }
        });
        if !transitioned {
            debug!("stop ignored: relay not running");
            return;
        }

        let listeners = self.listeners.lock().unwrap().clone();
        for listener in &listeners {
            listener.shutdown_accept();
        }
        info!(?mode, "relay stopping");

        let lifecycle = self.lifecycle.clone();
        let poll_interval = self.poll_interval;
        tokio::spawn(run_drain(listeners, mode, poll_interval, lifecycle));
    }

    /// Start the relay and block until it has fully stopped. The
    /// non-blocking pair is [`RelayManager::start`] plus
    /// [`RelayManager::wait_stopped`].
    pub async fn run(&self) -> Result<(), RelayError> {
        self.start()?;
        self.wait_stopped().await;
        Ok(())
    }

    /// Wait until the lifecycle reaches stopped.
    pub async fn wait_stopped(&self) {
        let mut rx = self.lifecycle.subscribe();
        // wait_for checks the current value first, so a stop that
        // completed before this call is still observed.
        let _ = rx.wait_for(|state| *state == LifecycleState::Stopped).await;
    }

    /// Live sessions across all listeners.
    pub async fn session_count(&self) -> usize {
        let listeners = self.listeners.lock().unwrap().clone();
        let mut total = 0;
        for listener in &listeners {
            total += listener.session_count().await;
        }
        total
    }
}

fn spawn_accept_loop(listener: Arc<Listener>) {
    tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            warn!(error = %e, "accept loop exited with error");
        }
    });
}

/// Poll live-session counts until every session is gone, forcing the
/// stragglers at the deadline, then mark the lifecycle stopped.
async fn run_drain(
    listeners: Vec<Arc<Listener>>,
    mode: StopMode,
    poll_interval: Duration,
    lifecycle: watch::Sender<LifecycleState>,
) {
    let deadline = match mode {
        StopMode::Immediate => {
            force_close_all(&listeners);
            None
        }
        StopMode::Drain(limit) => limit.map(|d| Instant::now() + d),
    };
    let mut forced = matches!(mode, StopMode::Immediate);

    loop {
        let mut live = 0;
        for listener in &listeners {
            live += listener.session_count().await;
        }
        if live == 0 {
            break;
        }

        if !forced {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!(live, "drain deadline reached, force-closing sessions");
                    force_close_all(&listeners);
                    forced = true;
                }
            }
        }

        debug!(live, "waiting for sessions to finish");
        let sleep_for = match deadline {
            Some(deadline) if !forced => poll_interval
                .min(deadline.saturating_duration_since(Instant::now()))
                .max(MIN_DRAIN_SLEEP),
            // Forced sessions unwind quickly; poll tightly.
            _ if forced => MIN_DRAIN_SLEEP,
            _ => poll_interval,
        };
        tokio::time::sleep(sleep_for).await;
    }

    let _ = lifecycle.send(LifecycleState::Stopped);
    info!("relay stopped");
}

fn force_close_all(listeners: &[Arc<Listener>]) {
    for listener in listeners {
        listener.force_close_sessions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn lifecycle_runs_forward_only() {
        let manager = RelayManager::new();
        assert_eq!(manager.state(), LifecycleState::NotRunning);

        manager.start().unwrap();
        assert_eq!(manager.state(), LifecycleState::Running);
        assert!(manager.start().is_err());

        manager.stop(StopMode::Immediate);
        timeout(Duration::from_secs(5), manager.wait_stopped())
            .await
            .unwrap();
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert!(manager.start().is_err());
    }

    #[tokio::test]
    async fn stop_before_start_is_ignored() {
        let manager = RelayManager::new();
        manager.stop(StopMode::Immediate);
        assert_eq!(manager.state(), LifecycleState::NotRunning);
    }

    #[tokio::test]
    async fn wait_stopped_observes_completed_stop() {
        let manager = RelayManager::new();
        manager.start().unwrap();
        manager.stop(StopMode::Drain(Some(Duration::from_millis(100))));
        timeout(Duration::from_secs(5), manager.wait_stopped())
            .await
            .unwrap();
        // A second wait returns immediately.
        timeout(Duration::from_secs(1), manager.wait_stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn remove_listener_unregisters_exactly_once() {
        let manager = RelayManager::new();
        let config =
            crate::listener::ListenerConfig::new("127.0.0.1:0".parse().unwrap(), "127.0.0.1", 1);
        let listener = manager
            .add_listener(config, Arc::new(crate::factory::DefaultSessionFactory))
            .await
            .unwrap();
        assert_eq!(manager.listener_count(), 1);

        manager.start().unwrap();
        assert!(manager.remove_listener(&listener));
        assert!(!manager.remove_listener(&listener));
        assert_eq!(manager.listener_count(), 0);
    }

    #[tokio::test]
    async fn add_listener_rejected_after_stop() {
        let manager = RelayManager::new();
        manager.start().unwrap();
        manager.stop(StopMode::Immediate);
        manager.wait_stopped().await;

        let config =
            crate::listener::ListenerConfig::new("127.0.0.1:0".parse().unwrap(), "127.0.0.1", 1);
        let result = manager
            .add_listener(config, Arc::new(crate::factory::DefaultSessionFactory))
            .await;
        assert!(result.is_err());
    }
}
