use crate::assist::{Activation, AssistBinding, AssistMode};
use crate::config::{save_preferences, Preferences};
use crate::error::{ConsoleError, ConsoleResult};
use crate::event::{ConsoleEvent, EVENT_QUEUE_CAPACITY};
use crate::session::SessionManager;
use crate::tasks::{TaskChange, TaskEngine};
use crate::transport::SessionTransport;
use crate::usage::NetworkUsage;
use chrono::Utc;
use opc_core::wire::{PushEvent, SubmitTaskRequest, UserAssistRequest};
use opc_core::{parse_session_address, ConnectivityState, FrameRate};
use opc_geometry::{
    assist_segment, navigate, route, Direction, GeometryError, LayoutMode, Path, Rect,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

/// Rectangles reported by the presentation layer for one recompute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutSnapshot {
    pub viewport_width: f64,
    #[serde(default)]
    pub sidebar_open: bool,
    pub anchor: Rect,
    pub bounds: Rect,
    #[serde(default)]
    pub sessions: BTreeMap<String, Rect>,
    #[serde(default)]
    pub task_cards: BTreeMap<String, Rect>,
    #[serde(default)]
    pub task_list: Rect,
}

impl LayoutSnapshot {
    pub fn mode(&self) -> LayoutMode {
        LayoutMode::for_viewport(self.viewport_width, self.sidebar_open)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionPaths {
    pub session_route: Option<Path>,
    pub assist_segment: Option<Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Task(String),
    Assist(String),
}

/// Aggregate root of the console. Owned by one event loop; every mutation
/// goes through `&mut self`.
pub struct Dashboard {
    sessions: SessionManager,
    tasks: TaskEngine,
    assist: AssistMode,
    usage: NetworkUsage,
    selected: Option<String>,
    token_usage: Option<u64>,
    notifications: Vec<Notification>,
    transport: Arc<dyn SessionTransport>,
    events: mpsc::Sender<ConsoleEvent>,
    preferences_path: Option<PathBuf>,
}

impl Dashboard {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        frame_rate: FrameRate,
        preferences_path: Option<PathBuf>,
    ) -> (Self, mpsc::Receiver<ConsoleEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let dashboard = Self {
            sessions: SessionManager::new(transport.clone(), tx.clone(), frame_rate),
            tasks: TaskEngine::new(),
            assist: AssistMode::new(),
            usage: NetworkUsage::new(),
            selected: None,
            token_usage: None,
            notifications: Vec::new(),
            transport,
            events: tx,
            preferences_path,
        };
        (dashboard, rx)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn tasks(&self) -> &TaskEngine {
        &self.tasks
    }

    pub fn assist(&self) -> &AssistMode {
        &self.assist
    }

    pub fn usage(&self) -> &NetworkUsage {
        &self.usage
    }

    pub fn reset_usage(&mut self) {
        self.usage.reset();
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn token_usage(&self) -> Option<u64> {
        self.token_usage
    }

    pub fn frame_rate(&self) -> FrameRate {
        self.sessions.frame_rate()
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    fn notify(&mut self, level: NotificationLevel, message: String) {
        match level {
            NotificationLevel::Info => info!(event = "notification", %message),
            NotificationLevel::Warning => warn!(event = "notification", %message),
            NotificationLevel::Error => error!(event = "notification", %message),
        }
        self.notifications.push(Notification { level, message });
    }

    fn is_connected(&self, address: &str) -> bool {
        self.sessions.state(address) == Some(ConnectivityState::Connected)
    }

    /// Opens (or finds) the session for operator input `input` and selects
    /// it when it was newly created.
    pub fn connect(&mut self, input: &str) -> ConsoleResult<String> {
        let address = parse_session_address(input)?;
        if self.sessions.connect(&address) {
            self.select_session(&address)?;
        }
        Ok(address)
    }

    pub fn select_session(&mut self, address: &str) -> ConsoleResult<()> {
        if !self.sessions.contains(address) {
            return Err(ConsoleError::UnknownSession(address.to_string()));
        }
        if let Some(binding) = self.assist.on_session_selected(address) {
            self.notify(
                NotificationLevel::Info,
                format!("Assist mode ended for task {}", binding.task),
            );
        }
        self.selected = Some(address.to_string());
        Ok(())
    }

    /// Moves the selection with the keyboard grid rules.
    pub fn navigate(
        &mut self,
        direction: Direction,
        mode: LayoutMode,
    ) -> ConsoleResult<Option<String>> {
        let current = self
            .selected
            .as_deref()
            .and_then(|address| self.sessions.position(address));
        let Some(idx) = navigate(current, self.sessions.len(), direction, mode) else {
            return Ok(None);
        };
        let Some(address) = self
            .sessions
            .sessions()
            .get(idx)
            .map(|session| session.address().to_string())
        else {
            return Ok(None);
        };
        if self.selected.as_deref() != Some(address.as_str()) {
            self.select_session(&address)?;
        }
        Ok(Some(address))
    }

    pub fn close_session(&mut self, address: &str) -> ConsoleResult<()> {
        self.sessions.close(address)?;
        self.usage.forget(address);
        if let Some(binding) = self.assist.on_session_closed(address) {
            self.notify(
                NotificationLevel::Info,
                format!("Assist mode ended: session of task {} closed", binding.task),
            );
        }
        if self.selected.as_deref() == Some(address) {
            self.selected = self
                .sessions
                .sessions()
                .first()
                .map(|session| session.address().to_string());
        }
        Ok(())
    }

    pub fn disconnect_session(&mut self, address: &str) -> ConsoleResult<()> {
        self.sessions.disconnect(address)
    }

    pub fn reconnect_session(&mut self, address: &str) -> ConsoleResult<()> {
        self.sessions.reconnect(address)
    }

    pub fn toggle_stream(&mut self, address: &str) -> ConsoleResult<bool> {
        self.sessions.toggle_stream(address)
    }

    pub fn capture(&mut self, address: &str) -> ConsoleResult<()> {
        self.sessions.capture(address)
    }

    pub fn mouse_click(&mut self, address: &str) -> ConsoleResult<()> {
        self.sessions.mouse_click(address)
    }

    pub fn mouse_move(&mut self, address: &str, x: i32, y: i32) -> ConsoleResult<()> {
        self.sessions.mouse_move(address, x, y)
    }

    /// Routes operator text: to the bound task while assist mode is active,
    /// otherwise as a new task on the selected session.
    pub fn send_message(&mut self, text: &str) -> ConsoleResult<SendOutcome> {
        if let Some(binding) = self.assist.binding().cloned() {
            self.send_assist_message(text)?;
            return Ok(SendOutcome::Assist(binding.task));
        }
        let address = self
            .selected
            .clone()
            .ok_or_else(|| ConsoleError::PreconditionFailed("no session selected".to_string()))?;
        self.create_task(&address, text).map(SendOutcome::Task)
    }

    /// Records the placeholder and dispatches the submit request without
    /// waiting for it.
    pub fn create_task(&mut self, address: &str, text: &str) -> ConsoleResult<String> {
        let state = self.sessions.state(address);
        let placeholder = self.tasks.create_optimistic(address, state, text, Utc::now())?;
        let request = SubmitTaskRequest {
            text: text.trim().to_string(),
            session_id: address.to_string(),
        };
        let transport = self.transport.clone();
        let address = address.to_string();
        let id = placeholder.clone();
        self.dispatch(async move {
            let result = transport.submit_task(&address, &request).await;
            ConsoleEvent::TaskSubmitted {
                address,
                placeholder: id,
                result,
            }
        });
        Ok(placeholder)
    }

    pub fn cancel_task(&mut self, task_id: &str) -> ConsoleResult<()> {
        let address = self.tasks.begin_cancel(task_id)?;
        let transport = self.transport.clone();
        let task_id = task_id.to_string();
        self.dispatch(async move {
            let result = transport.cancel_task(&address, &task_id).await;
            ConsoleEvent::CancelFinished { task_id, result }
        });
        Ok(())
    }

    pub fn activate_assist(&mut self, task_id: &str) -> ConsoleResult<Activation> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| ConsoleError::UnknownTask(task_id.to_string()))?;
        let connected = self.is_connected(&task.session);
        let activation = self.assist.request(task, connected)?;
        match &activation {
            Activation::Active(binding) => {
                self.selected = Some(binding.session.clone());
            }
            Activation::Pending(binding) => {
                self.sessions.ensure_connecting(&binding.session);
                self.selected = Some(binding.session.clone());
            }
        }
        Ok(activation)
    }

    pub fn deactivate_assist(&mut self) -> Option<AssistBinding> {
        self.assist.deactivate()
    }

    pub fn send_assist_message(&mut self, text: &str) -> ConsoleResult<()> {
        let binding = self
            .assist
            .binding()
            .cloned()
            .ok_or_else(|| {
                ConsoleError::PreconditionFailed("assist mode is not active".to_string())
            })?;
        let message = text.trim();
        if message.is_empty() {
            return Err(ConsoleError::PreconditionFailed(
                "message is empty".to_string(),
            ));
        }
        let request = UserAssistRequest {
            task_id: binding.task.clone(),
            message: message.to_string(),
        };
        let transport = self.transport.clone();
        self.dispatch(async move {
            let result = transport.user_assist(&binding.session, &request).await;
            ConsoleEvent::AssistReplied {
                task_id: binding.task,
                result,
            }
        });
        Ok(())
    }

    /// Applies the new rate to streaming sessions and persists it.
    pub fn set_frame_rate(&mut self, frame_rate: FrameRate) {
        self.sessions.set_frame_rate(frame_rate);
        let Some(path) = self.preferences_path.clone() else {
            return;
        };
        if let Err(err) = save_preferences(&path, &Preferences { frame_rate }) {
            self.notify(
                NotificationLevel::Warning,
                format!("Could not save preferences to {}: {err}", path.display()),
            );
        }
    }

    pub fn connection_paths(
        &self,
        layout: &LayoutSnapshot,
    ) -> Result<ConnectionPaths, GeometryError> {
        let mut paths = ConnectionPaths::default();
        let target = self
            .selected
            .as_ref()
            .and_then(|address| layout.sessions.get(address));
        if let Some(target) = target {
            let path = route(layout.anchor, *target, layout.bounds, layout.mode())?;
            paths.session_route = Some(path);
        }
        let card = self
            .assist
            .binding()
            .and_then(|binding| layout.task_cards.get(&binding.task));
        if let Some(card) = card {
            paths.assist_segment = assist_segment(*card, layout.anchor, layout.task_list)?;
        }
        Ok(paths)
    }

    fn dispatch<F>(&self, job: F)
    where
        F: Future<Output = ConsoleEvent> + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = job.await;
            if events.send(event).await.is_err() {
                debug!(event = "dashboard_gone");
            }
        });
    }

    fn observe_change(&mut self, change: &TaskChange) {
        if let Some(binding) = self.assist.observe(change) {
            self.notify(
                NotificationLevel::Info,
                format!("Assist mode ended: task {} is {}", binding.task, change.status),
            );
        }
    }

    fn resume_pending_assist(&mut self) {
        let sessions = &self.sessions;
        let resumed = self.assist.resume_pending(&self.tasks, |address| {
            sessions.state(address) == Some(ConnectivityState::Connected)
        });
        if let Some(binding) = resumed {
            self.selected = Some(binding.session.clone());
            self.notify(
                NotificationLevel::Info,
                format!("Assist mode active for task {}", binding.task),
            );
        }
    }

    pub fn handle_event(&mut self, event: ConsoleEvent) {
        trace!(event = "console_event", kind = event.kind());
        match event {
            ConsoleEvent::ChannelOpened {
                address,
                generation,
            } => {
                if !self.sessions.on_channel_opened(&address, generation) {
                    return;
                }
                for change in self.tasks.downgrade_in_progress(&address) {
                    self.observe_change(&change);
                }
                self.resume_pending_assist();
            }
            ConsoleEvent::ChannelClosed {
                address,
                generation,
                error,
            } => {
                if !self.sessions.on_channel_closed(&address, generation) {
                    return;
                }
                if let Some(err) = error {
                    self.notify(
                        NotificationLevel::Error,
                        format!("Connection to {address} failed: {err}"),
                    );
                }
            }
            ConsoleEvent::Push {
                address,
                generation,
                event,
            } => {
                if !self.sessions.accepts_push(&address, generation) {
                    return;
                }
                self.apply_push(&address, event);
            }
            ConsoleEvent::FrameFetched {
                address,
                generation,
                result,
            } => {
                let bytes = self.sessions.on_frame_fetched(&address, generation, result);
                if let Some(bytes) = bytes {
                    self.usage.record(&address, bytes);
                }
            }
            ConsoleEvent::ProbeSucceeded {
                address,
                generation,
            } => {
                self.sessions.on_probe_succeeded(&address, generation);
            }
            ConsoleEvent::Captured { address, result } => {
                if let Some(bytes) = self.sessions.on_captured(&address, result) {
                    self.usage.record(&address, bytes);
                }
            }
            ConsoleEvent::TaskSubmitted {
                address,
                placeholder,
                result,
            } => match result {
                Ok(response) => {
                    let task_id = response.task_id.filter(|id| !id.trim().is_empty());
                    if let Some(task_id) = task_id {
                        let change = self.tasks.resolve_placeholder(&placeholder, &task_id);
                        if let Some(change) = change {
                            self.observe_change(&change);
                        }
                    }
                }
                Err(err) => {
                    let reason = err.to_string();
                    let change = self.tasks.mark_submit_failed(&placeholder, &reason, Utc::now());
                    if let Some(change) = change {
                        self.observe_change(&change);
                    }
                    self.notify(
                        NotificationLevel::Error,
                        format!("Failed to send task to {address}: {err}"),
                    );
                }
            },
            ConsoleEvent::CancelFinished { task_id, result } => match result {
                Ok(response) if response.is_success() => {
                    if let Some(change) = self.tasks.mark_canceled(&task_id, Utc::now()) {
                        self.observe_change(&change);
                    }
                    self.notify(NotificationLevel::Info, format!("Task {task_id} canceled"));
                }
                Ok(response) => {
                    self.notify(
                        NotificationLevel::Error,
                        format!("Cancel of task {task_id} was refused: {}", response.result),
                    );
                }
                Err(err) => {
                    self.notify(
                        NotificationLevel::Error,
                        format!("Failed to cancel task {task_id}: {err}"),
                    );
                }
            },
            ConsoleEvent::AssistReplied { task_id, result } => match result {
                Ok(response) if response.accepted => {
                    debug!(event = "assist_message_accepted", task_id = %task_id);
                }
                Ok(_) => {
                    self.notify(
                        NotificationLevel::Warning,
                        format!("Assist message for task {task_id} was not accepted"),
                    );
                }
                Err(err) => {
                    self.notify(
                        NotificationLevel::Error,
                        format!("Failed to send assist message for task {task_id}: {err}"),
                    );
                }
            },
        }
    }

    fn apply_push(&mut self, address: &str, event: PushEvent) {
        match event {
            PushEvent::TaskUpdate(update) => {
                let change = self.tasks.apply_server_event(address, &update, Utc::now());
                self.observe_change(&change);
                self.resume_pending_assist();
            }
            PushEvent::Log(line) => {
                debug!(event = "agent_log", session = %address, line = %line);
                self.sessions.push_log(address, line);
            }
            PushEvent::TokenUpdate(total) => {
                self.token_usage = Some(total);
            }
            PushEvent::Heartbeat(stamp) => {
                trace!(event = "heartbeat", session = %address, stamp = %stamp);
            }
        }
    }
}
