//! The scheduler: the authoritative task table, priority queues, and
//! admission control.
//!
//! Admission is attempted whenever a task is submitted, leaves the
//! running set, or cancellation frees a slot. One level-keyed FIFO per
//! priority feeds admission, scanned `CRITICAL → HIGH → NORMAL → LOW`;
//! within a level, FIFO order is submission order. All scheduler state
//! (task table, queues, running set) lives behind a single
//! [`parking_lot::Mutex`] so admission can pop-and-promote atomically;
//! the mutex is never held across I/O, and event emission always
//! happens after it's dropped.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::dispatcher::{Dispatcher, EventName};
use crate::error::{Error, Result};
use crate::task::{Priority, Task, TaskId, TaskStatus};

struct Inner {
    tasks: HashMap<TaskId, Task>,
    queues: HashMap<Priority, VecDeque<TaskId>>,
    running: usize,
    max_concurrent: usize,
}

impl Inner {
    fn enqueue(&mut self, id: TaskId) {
        let priority = self.tasks[&id].priority;
        self.queues.entry(priority).or_default().push_back(id);
    }

    /// Pop admissible tasks off the queues (highest priority first,
    /// FIFO within a level) until the running set is full or the
    /// queues are dry. Skips ids that are no longer PENDING (e.g.
    /// cancelled while queued). Returns the ids admitted to RUNNING.
    fn try_admit(&mut self) -> Vec<TaskId> {
        let mut admitted = Vec::new();
        'outer: while self.running < self.max_concurrent {
            for priority in Priority::ALL_DESCENDING {
                let Some(queue) = self.queues.get_mut(&priority) else { continue };
                while let Some(id) = queue.pop_front() {
                    let Some(task) = self.tasks.get_mut(&id) else { continue };
                    if task.state != TaskStatus::Pending {
                        continue;
                    }
                    task.state = TaskStatus::Running;
                    task.started_at = Some(chrono::Utc::now());
                    self.running += 1;
                    admitted.push(id);
                    continue 'outer;
                }
            }
            break;
        }
        admitted
    }
}

/// Owns the task table and drives admission. Produces a stream of
/// task ids that just transitioned to RUNNING; the [`crate::engine`]
/// consumes that stream to actually perform the upstream call.
pub struct Scheduler {
    inner: Mutex<Inner>,
    dispatcher: std::sync::Arc<Dispatcher>,
    ready_tx: mpsc::UnboundedSender<TaskId>,
}

impl Scheduler {
    pub fn new(max_concurrent: usize, dispatcher: std::sync::Arc<Dispatcher>) -> (Self, mpsc::UnboundedReceiver<TaskId>) {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                queues: HashMap::new(),
                running: 0,
                max_concurrent,
            }),
            dispatcher,
            ready_tx,
        };
        (scheduler, ready_rx)
    }

    /// Insert `task` (already validated), enqueue it by priority, and
    /// attempt admission. Returns the assigned id.
    pub async fn submit(&self, task: Task) -> Result<TaskId> {
        let id = task.id;
        let (admitted, submitted_snapshot) = {
            let mut inner = self.inner.lock();
            inner.tasks.insert(id, task);
            inner.enqueue(id);
            let snapshot = inner.tasks[&id].clone();
            let admitted = inner.try_admit();
            (admitted, snapshot)
        };

        self.dispatcher.emit(EventName::OnSubmit, &submitted_snapshot).await;
        self.notify_admitted(admitted).await;
        Ok(id)
    }

    /// Cancel a task if it's PENDING or RUNNING. Returns `false`
    /// (no-op, no events) if the task is unknown or already terminal.
    pub async fn cancel(&self, id: TaskId) -> Result<bool> {
        let (cancelled_snapshot, admitted) = {
            let mut inner = self.inner.lock();
            let Some(task) = inner.tasks.get(&id) else {
                return Ok(false);
            };
            if !task.is_cancellable() {
                return Ok(false);
            }
            let was_running = task.state == TaskStatus::Running;

            let task = inner.tasks.get_mut(&id).unwrap();
            task.state = TaskStatus::Cancelled;
            task.completed_at = Some(chrono::Utc::now());
            let snapshot = task.clone();

            if was_running {
                inner.running = inner.running.saturating_sub(1);
            }
            let admitted = inner.try_admit();
            (snapshot, admitted)
        };

        self.dispatcher.emit(EventName::OnCancel, &cancelled_snapshot).await;
        self.notify_admitted(admitted).await;
        Ok(true)
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.inner.lock().tasks.get(&id).cloned()
    }

    pub fn list_all(&self) -> Vec<Task> {
        self.inner.lock().tasks.values().cloned().collect()
    }

    pub fn list_by_state(&self, state: TaskStatus) -> Vec<Task> {
        self.inner.lock().tasks.values().filter(|t| t.state == state).cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().running
    }

    pub fn on(&self, event: EventName, handler: crate::dispatcher::Handler) {
        self.dispatcher.on(event, handler);
    }

    /// Called by the engine once a provider call reaches a terminal
    /// outcome. Transitions the task out of RUNNING, frees a slot, and
    /// re-attempts admission. Returns the final snapshot, or `None` if
    /// the task was cancelled out from under the engine (in which case
    /// the engine must not fire `on_complete`/`on_error`).
    pub async fn finish(&self, id: TaskId, outcome: std::result::Result<String, String>) -> Option<Task> {
        let (snapshot, admitted, event) = {
            let mut inner = self.inner.lock();
            let Some(task) = inner.tasks.get_mut(&id) else {
                return None;
            };
            if task.state == TaskStatus::Cancelled {
                return None;
            }

            match outcome {
                Ok(result) => {
                    task.state = TaskStatus::Completed;
                    task.result = Some(result);
                }
                Err(error) => {
                    task.state = TaskStatus::Failed;
                    task.error = Some(error);
                }
            }
            task.completed_at = Some(chrono::Utc::now());
            let snapshot = task.clone();
            let event = if snapshot.state == TaskStatus::Completed {
                EventName::OnComplete
            } else {
                EventName::OnError
            };

            inner.running = inner.running.saturating_sub(1);
            let admitted = inner.try_admit();
            (snapshot, admitted, event)
        };

        self.dispatcher.emit(event, &snapshot).await;
        self.notify_admitted(admitted).await;
        Some(snapshot)
    }

    /// Record the model an admitted task will use and fire `on_start`.
    /// Called by the engine immediately before the first provider call.
    pub async fn mark_started(&self, id: TaskId, model: String) {
        let snapshot = {
            let mut inner = self.inner.lock();
            let Some(task) = inner.tasks.get_mut(&id) else { return };
            task.model = Some(model);
            task.clone()
        };
        self.dispatcher.emit(EventName::OnStart, &snapshot).await;
    }

    pub fn set_retry_count(&self, id: TaskId, retry_count: u32) {
        let mut inner = self.inner.lock();
        if let Some(task) = inner.tasks.get_mut(&id) {
            task.retry_count = retry_count;
        }
    }

    async fn notify_admitted(&self, admitted: Vec<TaskId>) {
        for id in admitted {
            let _ = self.ready_tx.send(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Priority, TaskOptions, TaskSubmission};
    use std::sync::Arc;

    fn submission(priority: Priority) -> Task {
        Task::from_submission(TaskSubmission {
            prompt: "hi".to_string(),
            priority,
            options: TaskOptions::default(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn admits_up_to_concurrency_cap() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (scheduler, mut ready_rx) = Scheduler::new(2, dispatcher);

        for _ in 0..3 {
            scheduler.submit(submission(Priority::Normal)).await.unwrap();
        }

        let mut admitted = 0;
        while let Ok(_id) = ready_rx.try_recv() {
            admitted += 1;
        }
        assert_eq!(admitted, 2);
        assert_eq!(scheduler.running_count(), 2);
        assert_eq!(scheduler.list_by_state(TaskStatus::Pending).len(), 1);
    }

    #[tokio::test]
    async fn higher_priority_admits_first_at_the_next_freed_slot() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (scheduler, mut ready_rx) = Scheduler::new(1, dispatcher);

        let low_id = scheduler.submit(submission(Priority::Low)).await.unwrap();
        let _ = ready_rx.try_recv().unwrap(); // low admitted immediately, fills the only slot
        scheduler.submit(submission(Priority::Normal)).await.unwrap();
        let critical_id = scheduler.submit(submission(Priority::Critical)).await.unwrap();

        // Free the slot; critical, submitted last, must still admit
        // before normal since it strictly outranks it.
        scheduler.finish(low_id, Ok("done".to_string())).await;
        let next = ready_rx.try_recv().unwrap();
        assert_eq!(next, critical_id);
    }

    #[tokio::test]
    async fn fifo_within_priority_level() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (scheduler, mut ready_rx) = Scheduler::new(1, dispatcher);

        let first = scheduler.submit(submission(Priority::Low)).await.unwrap();
        let _ = ready_rx.try_recv().unwrap();
        let second = scheduler.submit(submission(Priority::Low)).await.unwrap();
        let third = scheduler.submit(submission(Priority::Low)).await.unwrap();

        scheduler.finish(first, Ok("x".to_string())).await;
        assert_eq!(ready_rx.try_recv().unwrap(), second);

        scheduler.finish(second, Ok("x".to_string())).await;
        assert_eq!(ready_rx.try_recv().unwrap(), third);
    }

    #[tokio::test]
    async fn cancel_pending_task_never_runs_and_is_idempotent() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (scheduler, mut ready_rx) = Scheduler::new(0, dispatcher);

        let id = scheduler.submit(submission(Priority::Normal)).await.unwrap();
        assert!(ready_rx.try_recv().is_err());

        assert!(scheduler.cancel(id).await.unwrap());
        assert_eq!(scheduler.get(id).unwrap().state, TaskStatus::Cancelled);

        // Idempotent: cancelling an already-terminal task returns false.
        assert!(!scheduler.cancel(id).await.unwrap());
    }

    #[tokio::test]
    async fn cancelling_while_queued_is_skipped_on_admission() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (scheduler, mut ready_rx) = Scheduler::new(1, dispatcher);

        let first = scheduler.submit(submission(Priority::Normal)).await.unwrap();
        let _ = ready_rx.try_recv().unwrap();
        let second = scheduler.submit(submission(Priority::Normal)).await.unwrap();

        scheduler.cancel(second).await.unwrap();
        scheduler.finish(first, Ok("x".to_string())).await;

        // second was cancelled while pending; it must never be admitted.
        assert!(ready_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn finish_after_cancellation_is_a_no_op() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (scheduler, mut ready_rx) = Scheduler::new(1, dispatcher);

        let id = scheduler.submit(submission(Priority::Normal)).await.unwrap();
        let _ = ready_rx.try_recv().unwrap();
        scheduler.cancel(id).await.unwrap();

        let result = scheduler.finish(id, Ok("late".to_string())).await;
        assert!(result.is_none());
        assert_eq!(scheduler.get(id).unwrap().state, TaskStatus::Cancelled);
        assert!(scheduler.get(id).unwrap().result.is_none());
    }

    #[tokio::test]
    async fn empty_prompt_rejected_by_task_construction_before_reaching_scheduler() {
        let result = Task::from_submission(TaskSubmission { prompt: "".to_string(), ..Default::default() });
        assert!(matches!(result, Err(Error::IllegalArgument(_))));
    }
}
