//! Worker pool
//!
//! A fixed number of workers take runs from a FIFO queue and drive each one
//! to completion before taking the next. Every submitted run has a slot
//! holding its cancellation token and a watch channel that flips to
//! `Some(run)` exactly once, when the run reaches a terminal status. Polling
//! reads the channel and never blocks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::builder::BuilderKind;
use crate::engine::RunEngine;
use crate::error::PoolError;
use crate::models::{Run, RunOutcome, RunRequest, RunStatus};
use crate::tester::TesterKind;

/// Opaque reference to a submitted run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunHandle(Uuid);

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for RunHandle {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

struct Slot {
    state: watch::Sender<Option<Run>>,
    cancel: CancellationToken,
}

struct Shared {
    engine: Arc<RunEngine>,
    queue: Mutex<VecDeque<Run>>,
    notify: Notify,
    slots: DashMap<Uuid, Slot>,
    shutdown: CancellationToken,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Run>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `workers` worker tasks on the current runtime
    pub fn new(engine: Arc<RunEngine>, workers: usize) -> Self {
        let shared = Arc::new(Shared {
            engine,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            slots: DashMap::new(),
            shutdown: CancellationToken::new(),
        });

        let handles = (0..workers.max(1))
            .map(|index| tokio::spawn(worker_loop(index, shared.clone())))
            .collect();
        info!("Worker pool started with {} worker(s)", workers.max(1));

        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Validate and enqueue a run.
    ///
    /// Missing records, mismatched assignments and unknown builder/tester
    /// identifiers are rejected here, before the run exists.
    pub async fn submit(&self, request: RunRequest) -> Result<RunHandle, PoolError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(PoolError::Closed);
        }

        let store = self.shared.engine.store();
        let test = store.get_test(&request.test).await?;
        let submission = store.get_submission(&request.submission).await?;

        if test.assignment != submission.assignment {
            return Err(PoolError::AssignmentMismatch {
                test: test.id,
                submission: submission.id,
            });
        }
        if test.builder.parse::<BuilderKind>().is_err() {
            return Err(PoolError::UnknownPlugin {
                test: test.id,
                stage: "builder",
                id: test.builder,
            });
        }
        if test.tester.parse::<TesterKind>().is_err() {
            return Err(PoolError::UnknownPlugin {
                test: test.id,
                stage: "tester",
                id: test.tester,
            });
        }

        let run = Run::new(&request);
        let handle = RunHandle(run.id);
        let (state, _) = watch::channel(None);
        self.shared.slots.insert(
            run.id,
            Slot {
                state,
                cancel: CancellationToken::new(),
            },
        );

        debug!("Queued run {} ({} x {})", run.id, run.test, run.submission);
        self.shared.queue().push_back(run);
        self.shared.notify.notify_one();
        Ok(handle)
    }

    /// Whether the run has reached a terminal status. Never blocks.
    ///
    /// Unknown handles (including runs cancelled before they started) are
    /// never complete.
    pub fn is_complete(&self, handle: RunHandle) -> bool {
        self.shared
            .slots
            .get(&handle.0)
            .map(|slot| slot.state.borrow().is_some())
            .unwrap_or(false)
    }

    /// The terminal run, once complete
    pub fn get(&self, handle: RunHandle) -> Option<Run> {
        self.shared
            .slots
            .get(&handle.0)
            .and_then(|slot| slot.state.borrow().clone())
    }

    /// Resolve with the terminal run; `None` if the run was cancelled before it started
    pub async fn wait(&self, handle: RunHandle) -> Option<Run> {
        let mut rx = self.shared.slots.get(&handle.0)?.state.subscribe();
        let run = rx.wait_for(Option::is_some).await.ok()?.clone();
        run
    }

    /// Cancel a run.
    ///
    /// A queued run is dropped without trace. A running run has its process
    /// groups killed and finishes as `complete-exception-run`. Returns false
    /// if the run is unknown or already complete.
    pub fn cancel(&self, handle: RunHandle) -> bool {
        {
            let mut queue = self.shared.queue();
            if let Some(pos) = queue.iter().position(|run| run.id == handle.0) {
                queue.remove(pos);
                drop(queue);
                self.shared.slots.remove(&handle.0);
                info!("Run {} cancelled before start", handle.0);
                return true;
            }
        }

        match self.shared.slots.get(&handle.0) {
            Some(slot) if slot.state.borrow().is_none() => {
                slot.cancel.cancel();
                info!("Run {} cancellation requested", handle.0);
                true
            }
            _ => false,
        }
    }

    /// Drop the bookkeeping for a completed run. Returns false if it is still live.
    pub fn forget(&self, handle: RunHandle) -> bool {
        self.shared
            .slots
            .remove_if(&handle.0, |_, slot| slot.state.borrow().is_some())
            .is_some()
    }

    pub fn queued(&self) -> usize {
        self.shared.queue().len()
    }

    /// Stop accepting runs, let the workers drain the queue, and wait for them
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(index: usize, shared: Arc<Shared>) {
    debug!("Worker {} started", index);
    loop {
        let next = shared.queue().pop_front();
        match next {
            Some(run) => process(&shared, run).await,
            None if shared.shutdown.is_cancelled() => break,
            None => {
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = shared.shutdown.cancelled() => {}
                }
            }
        }
    }
    debug!("Worker {} exiting", index);
}

async fn process(shared: &Shared, run: Run) {
    let id = run.id;
    let cancel = match shared.slots.get(&id) {
        Some(slot) => slot.cancel.clone(),
        None => return,
    };

    // Run on its own task so a panic in any stage still yields a terminal run
    let fallback = run.clone();
    let engine = shared.engine.clone();
    let task = tokio::spawn(async move { engine.execute(run, cancel).await });
    let finished = match task.await {
        Ok(run) => run,
        Err(e) => {
            error!("Run {} aborted: {}", id, e);
            let mut run = fallback;
            run.start();
            shared
                .engine
                .complete(
                    &mut run,
                    RunOutcome::exception(RunStatus::CompleteExceptionRun, format!("Run aborted: {}", e)),
                )
                .await;
            run
        }
    };

    if let Some(slot) = shared.slots.get(&id) {
        slot.state.send_replace(Some(finished));
    }
}
