use crate::error::{ConsoleError, ConsoleResult};
use chrono::{DateTime, Utc};
use opc_core::wire::TaskUpdate;
use opc_core::{ConnectivityState, TaskStatus};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

pub const PLACEHOLDER_PREFIX: &str = "pending-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: String,
    pub placeholder: bool,
    pub session: String,
    pub status: TaskStatus,
    pub message: String,
    pub original_message: String,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Running time, frozen once the task reached a terminal state.
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.completed_at.unwrap_or(now) - self.created_at
    }

    fn set_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Promoted,
    Updated,
}

/// What a mutation did to one task. Assist mode watches these to drop a
/// binding whose task left `in-progress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskChange {
    pub id: String,
    pub previous_id: Option<String>,
    pub session: String,
    pub previous_status: Option<TaskStatus>,
    pub status: TaskStatus,
    pub kind: ChangeKind,
}

impl TaskChange {
    pub fn touches(&self, task_id: &str) -> bool {
        self.id == task_id || self.previous_id.as_deref() == Some(task_id)
    }
}

/// Client-side task list across all sessions, ordered by sequence number.
#[derive(Debug, Default)]
pub struct TaskEngine {
    tasks: Vec<Task>,
    next_sequence: u64,
}

impl TaskEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    pub fn for_session<'a>(&'a self, session: &'a str) -> impl Iterator<Item = &'a Task> + 'a {
        self.tasks.iter().filter(move |task| task.session == session)
    }

    pub fn first_in_progress(&self, session: &str) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|task| task.session == session && task.status == TaskStatus::InProgress)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn push(&mut self, task: Task) {
        self.tasks.push(task);
        self.tasks.sort_by_key(|task| task.sequence);
    }

    fn allocate_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Records a task the operator just sent, before the agent has named it.
    pub fn create_optimistic(
        &mut self,
        session: &str,
        connectivity: Option<ConnectivityState>,
        message: &str,
        now: DateTime<Utc>,
    ) -> ConsoleResult<String> {
        match connectivity {
            Some(ConnectivityState::Connected) => {}
            Some(state) => {
                return Err(ConsoleError::PreconditionFailed(format!(
                    "session {session} is {state}"
                )))
            }
            None => return Err(ConsoleError::UnknownSession(session.to_string())),
        }
        let message = message.trim();
        if message.is_empty() {
            return Err(ConsoleError::PreconditionFailed(
                "message is empty".to_string(),
            ));
        }

        let id = format!("{PLACEHOLDER_PREFIX}{}", Uuid::new_v4());
        let sequence = self.allocate_sequence();
        self.push(Task {
            id: id.clone(),
            placeholder: true,
            session: session.to_string(),
            status: TaskStatus::InTheQueue,
            message: message.to_string(),
            original_message: message.to_string(),
            sequence,
            created_at: now,
            completed_at: None,
        });
        debug!(event = "task_placeholder", task_id = %id, session = %session, sequence);
        Ok(id)
    }

    /// Reconciles one pushed status update: identity match first, then the
    /// earliest live placeholder on the same session with the same original
    /// message, else a new server-initiated task.
    pub fn apply_server_event(
        &mut self,
        session: &str,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> TaskChange {
        if let Some(task) = self.get_mut(&update.task_id) {
            let previous_status = task.status;
            if !update.message.is_empty() {
                task.message = update.message.clone();
            }
            if previous_status.is_terminal() {
                if update.status != previous_status {
                    debug!(
                        event = "terminal_status_kept",
                        task_id = %task.id,
                        status = %previous_status,
                        ignored = %update.status
                    );
                }
            } else {
                task.set_status(update.status, now);
            }
            return TaskChange {
                id: task.id.clone(),
                previous_id: None,
                session: task.session.clone(),
                previous_status: Some(previous_status),
                status: task.status,
                kind: ChangeKind::Updated,
            };
        }

        let placeholder = self
            .tasks
            .iter_mut()
            .filter(|task| {
                task.placeholder
                    && !task.status.is_terminal()
                    && task.session == session
                    && task.original_message == update.message
            })
            .min_by_key(|task| task.sequence);
        if let Some(task) = placeholder {
            let previous_id = std::mem::replace(&mut task.id, update.task_id.clone());
            let previous_status = task.status;
            task.placeholder = false;
            task.message = update.message.clone();
            task.set_status(update.status, now);
            info!(
                event = "task_promoted",
                task_id = %task.id,
                placeholder = %previous_id,
                sequence = task.sequence
            );
            return TaskChange {
                id: task.id.clone(),
                previous_id: Some(previous_id),
                session: task.session.clone(),
                previous_status: Some(previous_status),
                status: task.status,
                kind: ChangeKind::Promoted,
            };
        }

        let sequence = self.allocate_sequence();
        let mut task = Task {
            id: update.task_id.clone(),
            placeholder: false,
            session: session.to_string(),
            status: TaskStatus::InTheQueue,
            message: update.message.clone(),
            original_message: update.message.clone(),
            sequence,
            created_at: now,
            completed_at: None,
        };
        task.set_status(update.status, now);
        let change = TaskChange {
            id: task.id.clone(),
            previous_id: None,
            session: task.session.clone(),
            previous_status: None,
            status: task.status,
            kind: ChangeKind::Created,
        };
        debug!(event = "task_created", task_id = %task.id, session = %session, sequence);
        self.push(task);
        change
    }

    /// Applies the identity returned by the submit call. Returns `None` when
    /// a push already promoted the placeholder.
    pub fn resolve_placeholder(
        &mut self,
        placeholder_id: &str,
        task_id: &str,
    ) -> Option<TaskChange> {
        let idx = self
            .tasks
            .iter()
            .position(|task| task.id == placeholder_id && task.placeholder)?;

        if let Some(existing) = self.get(task_id) {
            // The agent reported the task under a different message; keep
            // the pushed record and drop the placeholder.
            let change = TaskChange {
                id: existing.id.clone(),
                previous_id: Some(placeholder_id.to_string()),
                session: existing.session.clone(),
                previous_status: Some(self.tasks[idx].status),
                status: existing.status,
                kind: ChangeKind::Promoted,
            };
            self.tasks.remove(idx);
            return Some(change);
        }

        let task = &mut self.tasks[idx];
        task.id = task_id.to_string();
        task.placeholder = false;
        info!(event = "task_resolved", task_id = %task.id, placeholder = %placeholder_id);
        Some(TaskChange {
            id: task.id.clone(),
            previous_id: Some(placeholder_id.to_string()),
            session: task.session.clone(),
            previous_status: Some(task.status),
            status: task.status,
            kind: ChangeKind::Promoted,
        })
    }

    pub fn mark_submit_failed(
        &mut self,
        placeholder_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<TaskChange> {
        let task = self.get_mut(placeholder_id)?;
        if task.status.is_terminal() {
            return None;
        }
        let previous_status = task.status;
        task.message = format!("Failed to send: {reason}");
        task.set_status(TaskStatus::Broken, now);
        Some(TaskChange {
            id: task.id.clone(),
            previous_id: None,
            session: task.session.clone(),
            previous_status: Some(previous_status),
            status: task.status,
            kind: ChangeKind::Updated,
        })
    }

    /// Checks that `id` may be canceled and returns its owning session.
    pub fn begin_cancel(&self, id: &str) -> ConsoleResult<String> {
        let task = self
            .get(id)
            .ok_or_else(|| ConsoleError::UnknownTask(id.to_string()))?;
        if task.placeholder {
            return Err(ConsoleError::PreconditionFailed(format!(
                "task {id} has not been accepted by the agent yet"
            )));
        }
        if !task.status.is_cancelable() {
            return Err(ConsoleError::PreconditionFailed(format!(
                "task {id} is {}",
                task.status
            )));
        }
        Ok(task.session.clone())
    }

    pub fn mark_canceled(&mut self, id: &str, now: DateTime<Utc>) -> Option<TaskChange> {
        let task = self.get_mut(id)?;
        if task.status.is_terminal() {
            return None;
        }
        let previous_status = task.status;
        task.set_status(TaskStatus::Canceled, now);
        Some(TaskChange {
            id: task.id.clone(),
            previous_id: None,
            session: task.session.clone(),
            previous_status: Some(previous_status),
            status: task.status,
            kind: ChangeKind::Updated,
        })
    }

    /// Reconnect rule: in-progress tasks of `session` go back to the queue
    /// until the agent confirms them again.
    pub fn downgrade_in_progress(&mut self, session: &str) -> Vec<TaskChange> {
        self.tasks
            .iter_mut()
            .filter(|task| task.session == session && task.status == TaskStatus::InProgress)
            .map(|task| {
                task.status = TaskStatus::InTheQueue;
                TaskChange {
                    id: task.id.clone(),
                    previous_id: None,
                    session: task.session.clone(),
                    previous_status: Some(TaskStatus::InProgress),
                    status: TaskStatus::InTheQueue,
                    kind: ChangeKind::Updated,
                }
            })
            .collect()
    }
}
