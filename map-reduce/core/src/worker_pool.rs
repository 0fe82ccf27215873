// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::shutdown_signal::{ShutdownSignal, TokenShutdownSignal};
use crate::task::WorkerId;
use crate::worker::WorkerExit;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Trait for creating workers
pub trait WorkerFactory: Send + 'static {
    type Worker: Future<Output = WorkerExit> + Send + 'static;

    fn create_worker(&mut self, id: WorkerId) -> Self::Worker;
}

impl<F, W> WorkerFactory for F
where
    F: FnMut(WorkerId) -> W + Send + 'static,
    W: Future<Output = WorkerExit> + Send + 'static,
{
    type Worker = W;

    fn create_worker(&mut self, id: WorkerId) -> W {
        (self)(id)
    }
}

/// What happened to the workers of a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub spawned: usize,
    pub crashed: usize,
}

/// Fixed-size set of workers; crashed workers are replaced with fresh ids
pub struct WorkerPool {
    shutdown: TokenShutdownSignal,
    supervisor: JoinHandle<PoolSummary>,
}

impl WorkerPool {
    pub fn spawn<F: WorkerFactory>(
        size: usize,
        mut factory: F,
        shutdown: TokenShutdownSignal,
    ) -> Self {
        let signal = shutdown.clone();
        let supervisor = tokio::spawn(async move {
            let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<(WorkerId, WorkerExit)>();
            let mut summary = PoolSummary::default();
            let mut running = 0usize;

            let mut spawn_worker = |summary: &mut PoolSummary| {
                let id = summary.spawned;
                summary.spawned += 1;
                let worker = tokio::spawn(factory.create_worker(id));
                let exit_tx = exit_tx.clone();
                tokio::spawn(async move {
                    // A panicking worker counts as a crash
                    let exit = worker.await.unwrap_or(WorkerExit::Crashed);
                    let _ = exit_tx.send((id, exit));
                });
            };

            for _ in 0..size {
                spawn_worker(&mut summary);
                running += 1;
            }
            info!("Started {} workers", size);

            while running > 0 {
                let Some((id, exit)) = exit_rx.recv().await else {
                    break;
                };
                running -= 1;
                debug!(worker_id = id, ?exit, "worker exited");

                if exit == WorkerExit::Crashed {
                    summary.crashed += 1;
                    if !signal.is_cancelled() {
                        warn!("Worker {} crashed, spawning replacement {}", id, summary.spawned);
                        spawn_worker(&mut summary);
                        running += 1;
                    }
                }
            }
            summary
        });

        Self {
            shutdown,
            supervisor,
        }
    }

    /// Cancels every worker and waits for all of them to exit
    pub async fn shutdown(self) -> PoolSummary {
        self.shutdown.shutdown();
        self.join().await
    }

    /// Waits for every worker to exit on its own
    pub async fn join(self) -> PoolSummary {
        self.supervisor.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_crashed_workers_are_replaced() {
        let crashes_left = Arc::new(AtomicUsize::new(2));
        let counter = crashes_left.clone();
        let pool = WorkerPool::spawn(
            2,
            move |_id| {
                let counter = counter.clone();
                async move {
                    let crash = counter
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                    if crash {
                        WorkerExit::Crashed
                    } else {
                        WorkerExit::Finished
                    }
                }
            },
            TokenShutdownSignal::default(),
        );

        let summary = pool.join().await;
        assert_eq!(summary.crashed, 2);
        assert_eq!(summary.spawned, 4);
    }

    #[tokio::test]
    async fn test_shutdown_stops_waiting_workers() {
        let shutdown = TokenShutdownSignal::default();
        let pool = WorkerPool::spawn(
            3,
            {
                let shutdown = shutdown.clone();
                move |_id| {
                    let shutdown = shutdown.clone();
                    async move {
                        shutdown.cancelled().await;
                        WorkerExit::Shutdown
                    }
                }
            },
            shutdown,
        );

        let summary = pool.shutdown().await;
        assert_eq!(summary.spawned, 3);
        assert_eq!(summary.crashed, 0);
    }
}
