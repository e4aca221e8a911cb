use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use health::HealthHandle;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Running,
    /// Too many panics, crashed workers are not restarted any more
    Degraded,
    Stopped,
}

struct Counters {
    panics: AtomicU32,
    running: AtomicUsize,
    max_panics: u32,
}

/// A fixed set of workers, each restarted when it panics until the group
/// has seen `max_panics` panics in total. A threshold of 0 counts as 1.
pub struct WorkerGroup {
    counters: Arc<Counters>,
    slots: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn spawn<F, Fut>(
        size: usize,
        max_panics: u32,
        liveness: HealthHandle,
        cancel: CancellationToken,
        make: F,
    ) -> Self
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let counters = Arc::new(Counters {
            panics: AtomicU32::new(0),
            running: AtomicUsize::new(size),
            max_panics: max_panics.max(1),
        });
        let make = Arc::new(make);

        let slots = (0..size)
            .map(|id| {
                let counters = counters.clone();
                let make = make.clone();
                let liveness = liveness.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    supervise(id, &counters, &liveness, &cancel, make.as_ref()).await;
                    counters.running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        info!("started {} replay upload workers", size);
        Self { counters, slots }
    }

    pub fn state(&self) -> GroupState {
        if self.counters.panics.load(Ordering::SeqCst) >= self.counters.max_panics {
            GroupState::Degraded
        } else if self.counters.running.load(Ordering::SeqCst) == 0 {
            GroupState::Stopped
        } else {
            GroupState::Running
        }
    }

    pub fn panics(&self) -> u32 {
        self.counters.panics.load(Ordering::SeqCst)
    }

    /// Waits for every worker to return.
    pub async fn join(self) {
        for slot in self.slots {
            if let Err(e) = slot.await {
                error!("replay worker supervisor failed: {}", e);
            }
        }
    }
}

async fn supervise<F, Fut>(
    id: usize,
    counters: &Counters,
    liveness: &HealthHandle,
    cancel: &CancellationToken,
    make: &F,
) where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let outcome = tokio::spawn(make(id)).await;
        let Err(e) = outcome else {
            return;
        };
        if !e.is_panic() || cancel.is_cancelled() {
            return;
        }

        counter!("rum_replay_worker_panics_total").increment(1);
        let panics = counters.panics.fetch_add(1, Ordering::SeqCst) + 1;
        if panics >= counters.max_panics {
            error!(
                "replay worker {} panicked, {} panics in the group, not restarting",
                id, panics
            );
            liveness
                .report_degraded(format!("{panics} replay worker panics"))
                .await;
            return;
        }
        warn!("replay worker {} panicked, restarting it", id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use health::{ComponentStatus, HealthRegistry};

    use super::*;

    async fn liveness(registry: &HealthRegistry) -> HealthHandle {
        registry
            .register("replay_workers", Duration::from_secs(30))
            .await
    }

    #[tokio::test]
    async fn workers_stop_on_cancel() {
        let registry = HealthRegistry::new("liveness");
        let cancel = CancellationToken::new();
        let group = WorkerGroup::spawn(4, 3, liveness(&registry).await, cancel.clone(), {
            let cancel = cancel.clone();
            move |_| {
                let cancel = cancel.clone();
                async move { cancel.cancelled().await }
            }
        });
        assert_eq!(group.state(), GroupState::Running);

        cancel.cancel();
        let counters = group.counters.clone();
        group.join().await;
        assert_eq!(counters.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_workers_are_restarted_then_degrade() {
        let registry = HealthRegistry::new("liveness");
        let cancel = CancellationToken::new();
        let starts = Arc::new(AtomicU32::new(0));

        let group = WorkerGroup::spawn(1, 3, liveness(&registry).await, cancel, {
            let starts = starts.clone();
            move |_| {
                let starts = starts.clone();
                async move {
                    starts.fetch_add(1, Ordering::SeqCst);
                    panic!("worker blew up");
                }
            }
        });

        for _ in 0..50 {
            if group.state() == GroupState::Degraded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(group.state(), GroupState::Degraded);
        assert_eq!(group.panics(), 3);
        group.join().await;
        assert_eq!(starts.load(Ordering::SeqCst), 3);

        // the registry applies reports asynchronously
        for _ in 0..50 {
            if registry.get_status().components.get("replay_workers")
                == Some(&ComponentStatus::Degraded("3 replay worker panics".to_string()))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker group never reported degraded");
    }

    #[tokio::test]
    async fn zero_panic_threshold_starts_running() {
        let registry = HealthRegistry::new("liveness");
        let cancel = CancellationToken::new();
        let group = WorkerGroup::spawn(2, 0, liveness(&registry).await, cancel.clone(), {
            let cancel = cancel.clone();
            move |_| {
                let cancel = cancel.clone();
                async move { cancel.cancelled().await }
            }
        });
        assert_eq!(group.state(), GroupState::Running);
        assert_eq!(group.counters.max_panics, 1);

        cancel.cancel();
        group.join().await;
    }
}
