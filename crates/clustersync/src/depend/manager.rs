//! Counting-barrier dependency manager.
//!
//! Every waiting app owns one barrier whose counter starts at the number of
//! its criteria. Each criterion owns a single-use signal; the first `fire`
//! decrements the barrier and later fires are ignored. `wait` resolves when
//! the counter reaches zero or the caller's token is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::criteria::{DependencyCriteria, WaitKind};
use super::error::DependError;

/// How a call to [`DependencyManager::wait`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every criterion of the app was satisfied (or it had none).
    Released,
    /// The caller's token fired first, or the manager was torn down.
    Cancelled,
}

struct Barrier {
    remaining: watch::Sender<usize>,
}

struct Signal {
    fired: AtomicBool,
    barrier: Arc<Barrier>,
}

impl Signal {
    /// Fires the signal. Returns false if it had already fired.
    fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.barrier
            .remaining
            .send_modify(|n| *n = n.saturating_sub(1));
        true
    }

    fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

struct Criterion {
    waiting_app: String,
    kind: WaitKind,
    settle: Duration,
    signal: Arc<Signal>,
}

#[derive(Default)]
struct State {
    /// Criteria indexed by the app they wait on.
    by_target: HashMap<String, Vec<Arc<Criterion>>>,
    /// Barriers indexed by the waiting app.
    barriers: HashMap<String, Arc<Barrier>>,
}

/// Dependency registry of one deployment instance.
pub struct DependencyManager {
    instance_id: String,
    state: Mutex<State>,
    teardown: CancellationToken,
}

impl DependencyManager {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            state: Mutex::new(State::default()),
            teardown: CancellationToken::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Registers the criteria `app` must satisfy before its resources are
    /// pushed. An empty list registers nothing.
    pub fn register_dependencies(
        &self,
        app: &str,
        criteria: &[DependencyCriteria],
    ) -> Result<(), DependError> {
        if let Some(c) = criteria.iter().find(|c| c.target_app == app) {
            return Err(DependError::SelfDependency(c.target_app.clone()));
        }

        let mut state = self.lock_state();
        if state.barriers.contains_key(app) {
            return Err(DependError::AlreadyRegistered(app.to_string()));
        }
        if criteria.is_empty() {
            return Ok(());
        }

        let (remaining, _) = watch::channel(criteria.len());
        let barrier = Arc::new(Barrier { remaining });

        for c in criteria {
            let criterion = Arc::new(Criterion {
                waiting_app: app.to_string(),
                kind: c.wait_kind,
                settle: Duration::from_secs(c.settle_delay_secs),
                signal: Arc::new(Signal {
                    fired: AtomicBool::new(false),
                    barrier: Arc::clone(&barrier),
                }),
            });
            state
                .by_target
                .entry(c.target_app.clone())
                .or_default()
                .push(criterion);
        }
        state.barriers.insert(app.to_string(), barrier);

        log::debug!(
            "Registered {} dependencies for app {} (instance {})",
            criteria.len(),
            app,
            self.instance_id
        );
        Ok(())
    }

    /// Blocks until every criterion of `app` is satisfied or `cancel` fires.
    ///
    /// Returns immediately with `Released` when the app has no registered
    /// criteria, which is also the behavior after a process restart.
    pub async fn wait(&self, cancel: &CancellationToken, app: &str) -> WaitOutcome {
        let barrier = self.lock_state().barriers.get(app).cloned();
        let Some(barrier) = barrier else {
            return WaitOutcome::Released;
        };

        let mut remaining = barrier.remaining.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("Dependency wait for app {} cancelled", app);
                WaitOutcome::Cancelled
            }
            _ = self.teardown.cancelled() => {
                log::info!(
                    "Dependency wait for app {} ended by instance {} teardown",
                    app,
                    self.instance_id
                );
                WaitOutcome::Cancelled
            }
            res = remaining.wait_for(|n| *n == 0) => match res {
                Ok(_) => {
                    log::info!("Dependencies of app {} satisfied", app);
                    WaitOutcome::Released
                }
                Err(_) => WaitOutcome::Cancelled,
            },
        }
    }

    /// Signals that `app` has been accepted by all of its clusters.
    pub async fn notify_deployed(&self, app: &str) {
        self.notify(app, WaitKind::Deployed).await;
    }

    /// Signals that `app` is ready on all of its clusters.
    pub async fn notify_ready(&self, app: &str) {
        self.notify(app, WaitKind::Ready).await;
    }

    /// Returns true if `app` has nothing left to wait for.
    pub fn is_unblocked(&self, app: &str) -> bool {
        self.pending(app) == 0
    }

    /// Number of unsatisfied criteria of `app`.
    pub fn pending(&self, app: &str) -> usize {
        self.lock_state()
            .barriers
            .get(app)
            .map(|b| *b.remaining.borrow())
            .unwrap_or(0)
    }

    /// Returns true if every registered app has been unblocked.
    pub fn all_unblocked(&self) -> bool {
        self.lock_state()
            .barriers
            .values()
            .all(|b| *b.remaining.borrow() == 0)
    }

    /// Ends every pending wait on this instance.
    pub(crate) fn tear_down(&self) {
        self.teardown.cancel();
    }

    async fn notify(&self, app: &str, kind: WaitKind) {
        let matching: Vec<Arc<Criterion>> = {
            let state = self.lock_state();
            state
                .by_target
                .get(app)
                .map(|list| {
                    list.iter()
                        .filter(|c| c.kind == kind && !c.signal.has_fired())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        if matching.is_empty() {
            return;
        }

        log::debug!(
            "App {} reached {}, releasing {} criteria",
            app,
            kind,
            matching.len()
        );

        let teardown = &self.teardown;
        join_all(matching.iter().map(|c| async move {
            if !c.settle.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(c.settle) => {}
                    _ = teardown.cancelled() => return,
                }
            }
            if c.signal.fire() {
                log::debug!("Criterion of {} on {} ({}) satisfied", c.waiting_app, app, kind);
            }
        }))
        .await;

        let mut state = self.lock_state();
        if let Some(list) = state.by_target.get_mut(app) {
            list.retain(|c| !c.signal.has_fired());
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Dependency state lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_on(target: &str) -> DependencyCriteria {
        DependencyCriteria::new(target, WaitKind::Ready)
    }

    #[tokio::test]
    async fn test_wait_without_dependencies_returns_immediately() {
        let dm = DependencyManager::new("1");
        let cancel = CancellationToken::new();
        assert_eq!(dm.wait(&cancel, "web").await, WaitOutcome::Released);
    }

    #[tokio::test]
    async fn test_self_dependency_rejected() {
        let dm = DependencyManager::new("1");
        let err = dm.register_dependencies("web", &[ready_on("web")]).unwrap_err();
        assert_eq!(err, DependError::SelfDependency("web".to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let dm = DependencyManager::new("1");
        dm.register_dependencies("web", &[ready_on("db")]).unwrap();
        let err = dm.register_dependencies("web", &[ready_on("db")]).unwrap_err();
        assert_eq!(err, DependError::AlreadyRegistered("web".to_string()));
    }

    #[tokio::test]
    async fn test_one_notify_releases_all_waiters() {
        let dm = Arc::new(DependencyManager::new("1"));
        let apps = ["a", "b", "c", "d"];
        for app in apps {
            dm.register_dependencies(app, &[ready_on("x")]).unwrap();
        }

        let mut handles = Vec::new();
        for app in apps {
            let dm = Arc::clone(&dm);
            handles.push(tokio::spawn(async move {
                dm.wait(&CancellationToken::new(), app).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handles.iter().all(|h| !h.is_finished()));

        dm.notify_ready("x").await;
        for h in handles {
            assert_eq!(h.await.unwrap(), WaitOutcome::Released);
        }
    }

    #[tokio::test]
    async fn test_wrong_kind_does_not_release() {
        let dm = DependencyManager::new("1");
        dm.register_dependencies("web", &[ready_on("db")]).unwrap();
        dm.notify_deployed("db").await;
        assert_eq!(dm.pending("web"), 1);
        dm.notify_ready("db").await;
        assert!(dm.is_unblocked("web"));
    }

    #[tokio::test]
    async fn test_waits_for_every_criterion() {
        let dm = Arc::new(DependencyManager::new("1"));
        dm.register_dependencies(
            "web",
            &[
                ready_on("db"),
                DependencyCriteria::new("cache", WaitKind::Deployed),
            ],
        )
        .unwrap();

        let waiter = {
            let dm = Arc::clone(&dm);
            tokio::spawn(async move { dm.wait(&CancellationToken::new(), "web").await })
        };

        dm.notify_ready("db").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(dm.pending("web"), 1);

        dm.notify_deployed("cache").await;
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Released);
    }

    #[tokio::test]
    async fn test_cancellation_returns_promptly() {
        let dm = Arc::new(DependencyManager::new("1"));
        dm.register_dependencies("web", &[ready_on("db")]).unwrap();
        let cancel = CancellationToken::new();

        let waiter = {
            let dm = Arc::clone(&dm);
            let cancel = cancel.clone();
            tokio::spawn(async move { dm.wait(&cancel, "web").await })
        };

        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait hung after cancellation")
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert_eq!(dm.pending("web"), 1);
    }

    #[tokio::test]
    async fn test_release_is_one_shot() {
        let dm = DependencyManager::new("1");
        dm.register_dependencies("web", &[ready_on("db")]).unwrap();
        dm.notify_ready("db").await;
        dm.notify_ready("db").await;
        assert!(dm.is_unblocked("web"));
        assert_eq!(
            dm.wait(&CancellationToken::new(), "web").await,
            WaitOutcome::Released
        );
    }

    #[tokio::test]
    async fn test_notify_without_waiters_is_noop() {
        let dm = DependencyManager::new("1");
        dm.notify_ready("nobody").await;
        dm.notify_deployed("nobody").await;
        assert!(dm.all_unblocked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delays_run_concurrently() {
        let dm = DependencyManager::new("1");
        dm.register_dependencies("a", &[ready_on("x").with_settle_delay(5)])
            .unwrap();
        dm.register_dependencies("b", &[ready_on("x").with_settle_delay(5)])
            .unwrap();

        let started = tokio::time::Instant::now();
        dm.notify_ready("x").await;
        assert!(dm.is_unblocked("a"));
        assert!(dm.is_unblocked("b"));
        // Sequential delays would take ten seconds.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_teardown_ends_waits() {
        let dm = Arc::new(DependencyManager::new("1"));
        dm.register_dependencies("web", &[ready_on("db")]).unwrap();
        let waiter = {
            let dm = Arc::clone(&dm);
            tokio::spawn(async move { dm.wait(&CancellationToken::new(), "web").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        dm.tear_down();
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Cancelled);
    }
}
