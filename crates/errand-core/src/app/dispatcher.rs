//! Dispatcher - admission loop.
//!
//! Claims eligible Pending tasks while below the concurrency cap and spawns
//! one executor per claimed task. The in-flight table lives only inside the
//! loop; other components reach it through [`DispatcherHandle`].
//!
//! An executor that could not record its final state leaves the task Running.
//! Such a task keeps counting against the cap until the dispatcher manages to
//! put it back in the queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::executor::{ExecutionOutcome, Executor};
use crate::domain::{
    ClaimCriteria, MAX_PER_PAGE, PageRequest, StorageError, TaskFilter, TaskId, TaskOrder,
    TaskPatch, TaskStatus, log_line,
};
use crate::handler::Signal;
use crate::ports::{Clock, TaskStore};

enum Command {
    Interrupt { task_id: TaskId, reason: String },
}

/// Cloneable handle to a running dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    commands: mpsc::UnboundedSender<Command>,
    wake: Arc<Notify>,
}

impl DispatcherHandle {
    /// Look for work now instead of at the next poll tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Abort the executor of `task_id` if it is in flight here.
    pub fn interrupt(&self, task_id: TaskId, reason: impl Into<String>) {
        let _ = self.commands.send(Command::Interrupt {
            task_id,
            reason: reason.into(),
        });
    }
}

struct InFlight {
    signal: watch::Sender<Signal>,
    join: JoinHandle<()>,
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    executor: Arc<Executor>,
    clock: Arc<dyn Clock>,
    max_concurrent: usize,
    poll_interval: Duration,
    in_flight: HashMap<TaskId, InFlight>,
    /// Left Running by a failed final write, not yet requeued.
    stranded: HashSet<TaskId>,
    commands: mpsc::UnboundedReceiver<Command>,
    wake: Arc<Notify>,
    done_tx: mpsc::UnboundedSender<(TaskId, ExecutionOutcome)>,
    done_rx: mpsc::UnboundedReceiver<(TaskId, ExecutionOutcome)>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<Executor>,
        clock: Arc<dyn Clock>,
        max_concurrent: usize,
        poll_interval: Duration,
    ) -> (Self, DispatcherHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());

        let dispatcher = Self {
            store,
            executor,
            clock,
            max_concurrent,
            poll_interval,
            in_flight: HashMap::new(),
            stranded: HashSet::new(),
            commands,
            wake: Arc::clone(&wake),
            done_tx,
            done_rx,
        };
        let handle = DispatcherHandle {
            commands: commands_tx,
            wake,
        };
        (dispatcher, handle)
    }

    /// Run until `shutdown` flips to true (or its sender is dropped), then
    /// interrupt every in-flight executor and wait for them.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_concurrent = self.max_concurrent,
            poll_interval = ?self.poll_interval,
            "dispatcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.fill().await;

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some((task_id, outcome)) = self.done_rx.recv() => {
                    self.finish(task_id, outcome);
                }
                Some(command) = self.commands.recv() => {
                    self.handle(command);
                }
                _ = self.wake.notified() => {
                    debug!("dispatcher woken");
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    debug!(in_flight = self.in_flight.len(), "poll tick");
                }
            }
        }

        self.drain().await;
        info!("dispatcher stopped");
    }

    /// Claim until the cap is reached or nothing is eligible.
    async fn fill(&mut self) {
        if !self.stranded.is_empty() {
            self.requeue_stranded().await;
        }
        while self.in_flight.len() + self.stranded.len() < self.max_concurrent {
            let criteria =
                ClaimCriteria::new(self.clock.now()).excluding(self.in_flight.keys().copied());
            match self.store.claim_next(&criteria).await {
                Ok(Some(task)) => {
                    let task_id = task.id;
                    info!(
                        %task_id,
                        task_type = %task.task_type,
                        priority = task.priority,
                        retry_count = task.retry_count,
                        "task claimed"
                    );

                    let (signal, signal_rx) = watch::channel(Signal::Run);
                    let executor = Arc::clone(&self.executor);
                    let done = self.done_tx.clone();
                    let join = tokio::spawn(async move {
                        let outcome = executor.execute(task, signal_rx).await;
                        let _ = done.send((task_id, outcome));
                    });
                    self.in_flight.insert(task_id, InFlight { signal, join });
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "claim failed, retrying on next tick");
                    break;
                }
            }
        }
    }

    fn finish(&mut self, task_id: TaskId, outcome: ExecutionOutcome) {
        self.in_flight.remove(&task_id);
        if outcome == ExecutionOutcome::StorageFailed {
            warn!(%task_id, "final state not recorded, task will be requeued");
            self.stranded.insert(task_id);
        }
        debug!(%task_id, ?outcome, in_flight = self.in_flight.len(), "executor finished");
    }

    async fn requeue_stranded(&mut self) {
        let ids: Vec<TaskId> = self.stranded.iter().copied().collect();
        for task_id in ids {
            let patch = TaskPatch::new()
                .expect(TaskStatus::Running)
                .status(TaskStatus::Pending)
                .progress(0)
                .started_at(None)
                .log(log_line(
                    self.clock.now(),
                    "Returned to queue after a storage failure",
                ));
            match self.store.update(task_id, patch).await {
                Ok(_) => {
                    info!(%task_id, "stranded task requeued");
                    self.stranded.remove(&task_id);
                }
                Err(
                    StorageError::Conflict { .. }
                    | StorageError::Terminal { .. }
                    | StorageError::NotFound(_),
                ) => {
                    self.stranded.remove(&task_id);
                }
                Err(err) => warn!(%task_id, error = %err, "stranded task still not requeued"),
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Interrupt { task_id, reason } => match self.in_flight.get(&task_id) {
                Some(flight) => {
                    let _ = flight.signal.send(Signal::Cancel(reason));
                }
                None => debug!(%task_id, "interrupt for a task that is not in flight"),
            },
        }
    }

    async fn drain(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        info!(in_flight = self.in_flight.len(), "interrupting in-flight tasks");
        for flight in self.in_flight.values() {
            let _ = flight.signal.send(Signal::Shutdown);
        }
        for (task_id, flight) in self.in_flight.drain() {
            if let Err(err) = flight.join.await {
                warn!(%task_id, error = %err, "executor ended abnormally");
            }
        }
    }
}

/// Put tasks left Running by a previous process back to Pending.
///
/// Call before the dispatcher starts. The retry budget is not charged.
pub async fn recover_interrupted(
    store: &dyn TaskStore,
    clock: &dyn Clock,
) -> Result<usize, StorageError> {
    let filter = TaskFilter::default().with_status(TaskStatus::Running);
    let mut stale = Vec::new();
    let mut page = PageRequest::first(MAX_PER_PAGE);
    loop {
        let batch = store.list(&filter, TaskOrder::AdmissionOrder, page).await?;
        stale.extend(batch.items.iter().map(|t| t.id));
        if !batch.has_next {
            break;
        }
        page.page += 1;
    }

    let mut recovered = 0;
    for task_id in stale {
        let patch = TaskPatch::new()
            .expect(TaskStatus::Running)
            .status(TaskStatus::Pending)
            .progress(0)
            .started_at(None)
            .log(log_line(clock.now(), "Recovered after restart, returned to queue"));
        match store.update(task_id, patch).await {
            Ok(_) => recovered += 1,
            Err(StorageError::Conflict { .. } | StorageError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
    }

    if recovered > 0 {
        info!(recovered, "requeued tasks interrupted by a previous shutdown");
    }
    Ok(recovered)
}
