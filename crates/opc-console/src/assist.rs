use crate::error::{ConsoleError, ConsoleResult};
use crate::tasks::{Task, TaskChange, TaskEngine};
use opc_core::TaskStatus;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistBinding {
    pub task: String,
    pub session: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AssistState {
    #[default]
    Inactive,
    Active(AssistBinding),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    Active(AssistBinding),
    /// Waiting for the owning session's channel to open.
    Pending(AssistBinding),
}

/// Binds operator input to one in-progress task.
///
/// The bound task is always `in-progress`: every task change passes through
/// `observe`, which drops the binding as soon as the task leaves that state.
#[derive(Debug, Default)]
pub struct AssistMode {
    state: AssistState,
    pending: Option<AssistBinding>,
}

impl AssistMode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &AssistState {
        &self.state
    }

    pub fn binding(&self) -> Option<&AssistBinding> {
        match &self.state {
            AssistState::Active(binding) => Some(binding),
            AssistState::Inactive => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.binding().is_some()
    }

    pub fn pending(&self) -> Option<&AssistBinding> {
        self.pending.as_ref()
    }

    /// Rejected requests leave both the binding and any pending activation
    /// untouched.
    pub fn request(&mut self, task: &Task, session_connected: bool) -> ConsoleResult<Activation> {
        if task.status != TaskStatus::InProgress {
            return Err(ConsoleError::PreconditionFailed(format!(
                "task {} is {}, assist needs an in-progress task",
                task.id, task.status
            )));
        }
        let binding = AssistBinding {
            task: task.id.clone(),
            session: task.session.clone(),
        };
        if self.pending.take().is_some() {
            debug!(event = "assist_pending_superseded", task_id = %binding.task);
        }
        if session_connected {
            info!(event = "assist_active", task_id = %binding.task, session = %binding.session);
            self.state = AssistState::Active(binding.clone());
            return Ok(Activation::Active(binding));
        }
        info!(event = "assist_pending", task_id = %binding.task, session = %binding.session);
        self.state = AssistState::Inactive;
        self.pending = Some(binding.clone());
        Ok(Activation::Pending(binding))
    }

    /// Always legal. Returns the binding that was active, if any.
    pub fn deactivate(&mut self) -> Option<AssistBinding> {
        self.pending = None;
        match std::mem::take(&mut self.state) {
            AssistState::Active(binding) => {
                info!(event = "assist_inactive", task_id = %binding.task);
                Some(binding)
            }
            AssistState::Inactive => None,
        }
    }

    /// Completes a pending activation once its session is connected and the
    /// task is (again) in progress. A pending task that vanished or finished
    /// is dropped.
    pub fn resume_pending<F>(
        &mut self,
        tasks: &TaskEngine,
        session_connected: F,
    ) -> Option<AssistBinding>
    where
        F: Fn(&str) -> bool,
    {
        let pending = self.pending.as_ref()?;
        let status = tasks.get(&pending.task).map(|task| task.status);
        match status {
            None => {
                self.pending = None;
                None
            }
            Some(status) if status.is_terminal() => {
                debug!(event = "assist_pending_dropped", task_id = %pending.task, status = %status);
                self.pending = None;
                None
            }
            Some(TaskStatus::InProgress) if session_connected(&pending.session) => {
                let binding = self.pending.take()?;
                info!(event = "assist_active", task_id = %binding.task, session = %binding.session);
                self.state = AssistState::Active(binding.clone());
                Some(binding)
            }
            Some(_) => None,
        }
    }

    /// Follows renames and forces deactivation when the bound task leaves
    /// `in-progress`. Returns the binding that was dropped.
    pub fn observe(&mut self, change: &TaskChange) -> Option<AssistBinding> {
        if let Some(pending) = self.pending.as_mut() {
            if change.touches(&pending.task) {
                pending.task = change.id.clone();
            }
        }

        let AssistState::Active(binding) = &mut self.state else {
            return None;
        };
        if !change.touches(&binding.task) {
            return None;
        }
        binding.task = change.id.clone();
        if change.status == TaskStatus::InProgress {
            return None;
        }
        info!(
            event = "assist_forced_off",
            task_id = %change.id,
            status = %change.status
        );
        match std::mem::take(&mut self.state) {
            AssistState::Active(binding) => Some(binding),
            AssistState::Inactive => None,
        }
    }

    pub fn on_session_closed(&mut self, session: &str) -> Option<AssistBinding> {
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.session == session)
        {
            self.pending = None;
        }
        if self.binding().is_some_and(|binding| binding.session == session) {
            return self.deactivate();
        }
        None
    }

    /// Browsing to another session ends assist mode.
    pub fn on_session_selected(&mut self, session: &str) -> Option<AssistBinding> {
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.session != session)
        {
            self.pending = None;
        }
        if self.binding().is_some_and(|binding| binding.session != session) {
            return self.deactivate();
        }
        None
    }
}
