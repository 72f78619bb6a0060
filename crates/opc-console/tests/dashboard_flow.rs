use async_trait::async_trait;
use opc_console::config::load_preferences;
use opc_console::{
    Activation, ConsoleEvent, Dashboard, FrameStream, LayoutSnapshot, NotificationLevel,
    Screenshot, SendOutcome, SessionTransport, StreamTimer, TransportError,
};
use opc_core::wire::{
    CancelResponse, SubmitTaskRequest, SubmitTaskResponse, UserAssistRequest, UserAssistResponse,
    CANCEL_SUCCESS_RESULT,
};
use opc_core::{ConnectivityState, FrameRate, TaskStatus};
use opc_geometry::Rect;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const A: &str = "10.0.0.7";
const B: &str = "10.0.0.8";

type FrameSender = mpsc::UnboundedSender<Result<String, TransportError>>;

/// In-memory agent. Each opened channel is fed from a sender the test holds
/// through `push` and `drop_channel`.
struct FakeAgent {
    reachable: AtomicBool,
    channels: Mutex<HashMap<String, FrameSender>>,
    opens: AtomicUsize,
    screenshots: AtomicUsize,
    submit_task_id: Mutex<Option<String>>,
    submit_fails: AtomicBool,
    cancel_result: Mutex<String>,
    submitted: Mutex<Vec<SubmitTaskRequest>>,
    assist_messages: Mutex<Vec<UserAssistRequest>>,
}

impl FakeAgent {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(true),
            channels: Mutex::new(HashMap::new()),
            opens: AtomicUsize::new(0),
            screenshots: AtomicUsize::new(0),
            submit_task_id: Mutex::new(Some("t1".to_string())),
            submit_fails: AtomicBool::new(false),
            cancel_result: Mutex::new(CANCEL_SUCCESS_RESULT.to_string()),
            submitted: Mutex::new(Vec::new()),
            assist_messages: Mutex::new(Vec::new()),
        })
    }

    fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn push(&self, address: &str, frame: &str) {
        let channels = self.channels.lock().expect("channels");
        let sender = channels.get(address).expect("channel open");
        sender.send(Ok(frame.to_string())).expect("channel reader alive");
    }

    fn push_task(&self, address: &str, task_id: &str, status: &str, message: &str) {
        let frame = serde_json::json!({
            "type": "taskUpdate",
            "data": {"taskId": task_id, "status": status, "message": message},
        });
        self.push(address, &frame.to_string());
    }

    fn drop_channel(&self, address: &str, error: Option<&str>) {
        let sender = self
            .channels
            .lock()
            .expect("channels")
            .remove(address)
            .expect("channel open");
        if let Some(reason) = error {
            let _ = sender.send(Err(TransportError::Channel(reason.to_string())));
        }
    }

    fn unreachable(url: &str) -> TransportError {
        TransportError::Request {
            url: url.to_string(),
            reason: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl SessionTransport for FakeAgent {
    async fn screenshot(&self, _address: &str) -> Result<Screenshot, TransportError> {
        self.screenshots.fetch_add(1, Ordering::SeqCst);
        Ok(Screenshot {
            bytes: vec![0u8; 16],
            length_hint: Some(100),
        })
    }

    async fn ping(&self, address: &str) -> Result<(), TransportError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Self::unreachable(address))
        }
    }

    async fn submit_task(
        &self,
        address: &str,
        request: &SubmitTaskRequest,
    ) -> Result<SubmitTaskResponse, TransportError> {
        self.submitted.lock().expect("submitted").push(request.clone());
        if self.submit_fails.load(Ordering::SeqCst) {
            return Err(TransportError::Status {
                url: format!("http://{address}:8080/llm-input"),
                status: 500,
            });
        }
        Ok(SubmitTaskResponse {
            task_id: self.submit_task_id.lock().expect("task id").clone(),
        })
    }

    async fn cancel_task(
        &self,
        _address: &str,
        _task_id: &str,
    ) -> Result<CancelResponse, TransportError> {
        Ok(CancelResponse {
            result: self.cancel_result.lock().expect("cancel result").clone(),
        })
    }

    async fn user_assist(
        &self,
        _address: &str,
        request: &UserAssistRequest,
    ) -> Result<UserAssistResponse, TransportError> {
        self.assist_messages
            .lock()
            .expect("assist messages")
            .push(request.clone());
        Ok(UserAssistResponse { accepted: true })
    }

    async fn mouse_click(&self, _address: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn mouse_move(&self, _address: &str, _x: i32, _y: i32) -> Result<(), TransportError> {
        Ok(())
    }

    async fn open_channel(&self, address: &str) -> Result<FrameStream, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Channel(format!("{address}: refused")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .expect("channels")
            .insert(address.to_string(), tx);
        let frames = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        Ok(Box::pin(frames))
    }
}

fn console(agent: &Arc<FakeAgent>) -> (Dashboard, mpsc::Receiver<ConsoleEvent>) {
    Dashboard::new(agent.clone(), FrameRate::One, None)
}

async fn pump_until<F>(
    dashboard: &mut Dashboard,
    events: &mut mpsc::Receiver<ConsoleEvent>,
    mut done: F,
) where
    F: FnMut(&Dashboard) -> bool,
{
    timeout(Duration::from_secs(5), async {
        while !done(&*dashboard) {
            let event = events.recv().await.expect("event queue open");
            dashboard.handle_event(event);
        }
    })
    .await
    .expect("condition reached in time");
}

fn state(dashboard: &Dashboard, address: &str) -> Option<ConnectivityState> {
    dashboard.sessions().state(address)
}

fn status(dashboard: &Dashboard, task_id: &str) -> Option<TaskStatus> {
    dashboard.tasks().get(task_id).map(|task| task.status)
}

async fn connected(
    agent: &Arc<FakeAgent>,
    address: &str,
) -> (Dashboard, mpsc::Receiver<ConsoleEvent>) {
    let (mut dashboard, mut events) = console(agent);
    dashboard.connect(address).expect("connect");
    pump_until(&mut dashboard, &mut events, |d| {
        state(d, address) == Some(ConnectivityState::Connected)
    })
    .await;
    (dashboard, events)
}

#[tokio::test]
async fn connect_opens_channel_and_streams_frames() {
    let agent = FakeAgent::new();
    let (mut dashboard, mut events) = console(&agent);

    let address = dashboard.connect(" 10.0.0.7 ").expect("connect");
    assert_eq!(address, A);
    assert_eq!(dashboard.selected(), Some(A));
    assert_eq!(state(&dashboard, A), Some(ConnectivityState::Connecting));

    pump_until(&mut dashboard, &mut events, |d| {
        d.sessions().get(A).is_some_and(|s| s.image().is_some())
    })
    .await;
    let session = dashboard.sessions().get(A).expect("session");
    assert!(session.is_streaming());
    assert!(!session.is_recovering());
    assert!(agent.screenshots.load(Ordering::SeqCst) >= 1);
    assert!(dashboard.usage().total() >= 100);
    assert_eq!(dashboard.usage().session(A), dashboard.usage().total());

    // Connecting to an existing address opens nothing new.
    dashboard.connect(A).expect("connect again");
    assert_eq!(agent.opens.load(Ordering::SeqCst), 1);
    assert_eq!(dashboard.sessions().len(), 1);
}

#[tokio::test]
async fn submitted_task_is_promoted_and_completed_by_pushes() {
    let agent = FakeAgent::new();
    let (mut dashboard, mut events) = connected(&agent, A).await;

    let outcome = dashboard.send_message("open the settings page").expect("send");
    let SendOutcome::Task(placeholder) = outcome else {
        panic!("expected a new task, got {outcome:?}");
    };
    assert!(placeholder.starts_with("pending-"));
    assert_eq!(status(&dashboard, &placeholder), Some(TaskStatus::InTheQueue));

    pump_until(&mut dashboard, &mut events, |d| d.tasks().get("t1").is_some()).await;
    assert!(dashboard.tasks().get(&placeholder).is_none());
    assert_eq!(dashboard.tasks().len(), 1);
    let submitted = agent.submitted.lock().expect("submitted").clone();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].session_id, A);
    assert_eq!(submitted[0].text, "open the settings page");

    agent.push_task(A, "t1", "in-progress", "open the settings page");
    pump_until(&mut dashboard, &mut events, |d| {
        status(d, "t1") == Some(TaskStatus::InProgress)
    })
    .await;

    agent.push_task(A, "t1", "completed", "settings opened");
    pump_until(&mut dashboard, &mut events, |d| {
        status(d, "t1") == Some(TaskStatus::Completed)
    })
    .await;
    let task = dashboard.tasks().get("t1").expect("task");
    assert_eq!(task.message, "settings opened");
    assert!(task.completed_at.is_some());

    // Terminal states do not move again.
    agent.push_task(A, "t1", "in-progress", "");
    agent.push(A, r#"{"type":"tokenUpdate","total":4096}"#);
    pump_until(&mut dashboard, &mut events, |d| d.token_usage() == Some(4096)).await;
    assert_eq!(status(&dashboard, "t1"), Some(TaskStatus::Completed));
}

#[tokio::test]
async fn submit_failure_breaks_placeholder_and_notifies() {
    let agent = FakeAgent::new();
    agent.submit_fails.store(true, Ordering::SeqCst);
    let (mut dashboard, mut events) = connected(&agent, A).await;

    let placeholder = dashboard.create_task(A, "fill the form").expect("create");
    pump_until(&mut dashboard, &mut events, |d| {
        status(d, &placeholder) == Some(TaskStatus::Broken)
    })
    .await;
    let task = dashboard.tasks().get(&placeholder).expect("placeholder");
    assert!(task.message.starts_with("Failed to send:"));
    let notes = dashboard.drain_notifications();
    assert!(notes
        .iter()
        .any(|note| note.level == NotificationLevel::Error && note.message.contains(A)));
}

#[tokio::test]
async fn task_creation_requires_connected_session() {
    let agent = FakeAgent::new();
    agent.set_reachable(false);
    let (mut dashboard, mut events) = console(&agent);
    dashboard.connect(A).expect("connect");
    pump_until(&mut dashboard, &mut events, |d| {
        state(d, A) == Some(ConnectivityState::Disconnected)
    })
    .await;

    assert!(dashboard.send_message("anything").is_err());
    assert!(dashboard.create_task(B, "unknown session").is_err());
    assert!(dashboard.tasks().is_empty());
}

#[tokio::test]
async fn assist_messages_go_to_bound_task_until_it_breaks() {
    let agent = FakeAgent::new();
    let (mut dashboard, mut events) = connected(&agent, A).await;
    agent.push_task(A, "t1", "in-progress", "book a flight");
    pump_until(&mut dashboard, &mut events, |d| {
        status(d, "t1") == Some(TaskStatus::InProgress)
    })
    .await;

    let activation = dashboard.activate_assist("t1").expect("activate");
    assert!(matches!(activation, Activation::Active(_)));
    let outcome = dashboard.send_message("use the window seat").expect("assist");
    assert_eq!(outcome, SendOutcome::Assist("t1".to_string()));
    assert!(dashboard.send_assist_message("   ").is_err());

    pump_until(&mut dashboard, &mut events, |_| {
        agent.assist_messages.lock().expect("assist").len() == 1
    })
    .await;
    agent.push_task(A, "t1", "broken", "captcha");
    pump_until(&mut dashboard, &mut events, |d| !d.assist().is_active()).await;
    let notes = dashboard.drain_notifications();
    assert!(notes.iter().any(|note| note.message.contains("Assist mode ended")));

    let sent = agent.assist_messages.lock().expect("assist").clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].task_id, "t1");
    assert_eq!(sent[0].message, "use the window seat");

    // Next message becomes a new task again.
    let outcome = dashboard.send_message("try again").expect("send");
    assert!(matches!(outcome, SendOutcome::Task(_)));
}

#[tokio::test]
async fn lost_channel_recovers_and_downgrades_running_tasks() {
    let agent = FakeAgent::new();
    let (mut dashboard, mut events) = connected(&agent, A).await;
    agent.push_task(A, "t1", "in-progress", "scrape prices");
    pump_until(&mut dashboard, &mut events, |d| {
        status(d, "t1") == Some(TaskStatus::InProgress)
    })
    .await;

    agent.set_reachable(false);
    agent.drop_channel(A, Some("connection reset"));
    pump_until(&mut dashboard, &mut events, |d| {
        state(d, A) == Some(ConnectivityState::Disconnected)
    })
    .await;
    let session = dashboard.sessions().get(A).expect("session");
    assert!(session.is_recovering());
    assert!(!session.is_streaming());
    assert!(session.image().is_none());
    assert!(dashboard
        .drain_notifications()
        .iter()
        .any(|note| note.level == NotificationLevel::Error));

    agent.set_reachable(true);
    pump_until(&mut dashboard, &mut events, |d| {
        state(d, A) == Some(ConnectivityState::Connected)
    })
    .await;
    let session = dashboard.sessions().get(A).expect("session");
    assert!(session.is_streaming());
    assert!(!session.is_recovering());
    assert_eq!(status(&dashboard, "t1"), Some(TaskStatus::InTheQueue));
}

#[tokio::test]
async fn pending_assist_activates_after_reconnect_confirmation() {
    let agent = FakeAgent::new();
    let (mut dashboard, mut events) = connected(&agent, A).await;
    agent.push_task(A, "t1", "in-progress", "scrape prices");
    pump_until(&mut dashboard, &mut events, |d| {
        status(d, "t1") == Some(TaskStatus::InProgress)
    })
    .await;

    agent.set_reachable(false);
    agent.drop_channel(A, None);
    pump_until(&mut dashboard, &mut events, |d| {
        state(d, A) == Some(ConnectivityState::Disconnected)
    })
    .await;

    let activation = dashboard.activate_assist("t1").expect("pending");
    assert!(matches!(activation, Activation::Pending(_)));
    assert!(!dashboard.assist().is_active());

    agent.set_reachable(true);
    pump_until(&mut dashboard, &mut events, |d| {
        state(d, A) == Some(ConnectivityState::Connected)
    })
    .await;
    assert!(!dashboard.assist().is_active());
    assert!(dashboard.assist().pending().is_some());

    agent.push_task(A, "t1", "in-progress", "scrape prices");
    pump_until(&mut dashboard, &mut events, |d| d.assist().is_active()).await;
    assert_eq!(
        dashboard.assist().binding().map(|b| b.task.as_str()),
        Some("t1")
    );
}

#[tokio::test]
async fn manual_disconnect_and_paused_stream_stay_idle() {
    let agent = FakeAgent::new();
    let (mut dashboard, mut events) = connected(&agent, A).await;

    assert!(!dashboard.toggle_stream(A).expect("pause"));
    let session = dashboard.sessions().get(A).expect("session");
    assert!(!session.is_streaming());
    assert!(session.stream_paused());
    assert!(dashboard.toggle_stream(A).expect("resume"));

    dashboard.disconnect_session(A).expect("disconnect");
    let session = dashboard.sessions().get(A).expect("session");
    assert_eq!(session.state(), ConnectivityState::Disconnected);
    assert!(!session.is_streaming());
    assert!(!session.is_recovering());
    assert!(!session.has_channel());
    assert!(dashboard.capture(A).is_err());
    assert!(dashboard.mouse_click(A).is_err());
    assert!(dashboard.toggle_stream(A).is_err());

    dashboard.reconnect_session(A).expect("reconnect");
    pump_until(&mut dashboard, &mut events, |d| {
        state(d, A) == Some(ConnectivityState::Connected)
    })
    .await;
    assert_eq!(agent.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancel_outcomes_follow_agent_acknowledgement() {
    let agent = FakeAgent::new();
    let (mut dashboard, mut events) = connected(&agent, A).await;
    agent.push_task(A, "t1", "in-progress", "long job");
    agent.push_task(A, "t2", "in-the-queue", "second job");
    pump_until(&mut dashboard, &mut events, |d| d.tasks().len() == 2).await;

    dashboard.cancel_task("t1").expect("cancel");
    pump_until(&mut dashboard, &mut events, |d| {
        status(d, "t1") == Some(TaskStatus::Canceled)
    })
    .await;
    assert!(dashboard.cancel_task("t1").is_err());
    dashboard.drain_notifications();

    *agent.cancel_result.lock().expect("cancel result") = "Task not found".to_string();
    dashboard.cancel_task("t2").expect("cancel");
    pump_until(&mut dashboard, &mut events, |d| {
        d.notifications()
            .iter()
            .any(|note| note.level == NotificationLevel::Error)
    })
    .await;
    assert_eq!(status(&dashboard, "t2"), Some(TaskStatus::InTheQueue));
}

#[tokio::test]
async fn closing_selected_session_falls_back_to_first() {
    let agent = FakeAgent::new();
    let (mut dashboard, mut events) = console(&agent);
    dashboard.connect(A).expect("connect a");
    dashboard.connect(B).expect("connect b");
    assert_eq!(dashboard.selected(), Some(B));
    pump_until(&mut dashboard, &mut events, |d| {
        state(d, A) == Some(ConnectivityState::Connected)
            && state(d, B) == Some(ConnectivityState::Connected)
    })
    .await;
    agent.push_task(B, "t9", "in-progress", "on b");
    pump_until(&mut dashboard, &mut events, |d| d.tasks().get("t9").is_some()).await;
    dashboard.activate_assist("t9").expect("activate");

    dashboard.close_session(B).expect("close b");
    assert_eq!(dashboard.selected(), Some(A));
    assert!(!dashboard.assist().is_active());
    assert_eq!(dashboard.usage().session(B), 0);
    // Tasks outlive their session.
    assert!(dashboard.tasks().get("t9").is_some());

    dashboard.close_session(A).expect("close a");
    assert_eq!(dashboard.selected(), None);
    assert!(dashboard.close_session(A).is_err());
}

#[tokio::test]
async fn frame_rate_is_persisted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("opconsole").join("preferences.toml");
    let agent = FakeAgent::new();
    let (mut dashboard, _events) = Dashboard::new(agent, FrameRate::Five, Some(path.clone()));

    dashboard.set_frame_rate(FrameRate::Ten);
    assert_eq!(dashboard.frame_rate(), FrameRate::Ten);
    let stored = load_preferences(&path).expect("preferences");
    assert_eq!(stored.frame_rate, FrameRate::Ten);
    assert!(dashboard.drain_notifications().is_empty());
}

#[tokio::test]
async fn frame_rate_change_restarts_only_streaming_loops() {
    let agent = FakeAgent::new();
    let (mut dashboard, mut events) = console(&agent);
    dashboard.connect(A).expect("connect a");
    dashboard.connect(B).expect("connect b");
    pump_until(&mut dashboard, &mut events, |d| {
        state(d, A) == Some(ConnectivityState::Connected)
            && state(d, B) == Some(ConnectivityState::Connected)
    })
    .await;
    assert!(!dashboard.toggle_stream(B).expect("pause b"));

    dashboard.set_frame_rate(FrameRate::Ten);

    let a = dashboard.sessions().get(A).expect("session a");
    match a.timer() {
        StreamTimer::Streaming(task) => assert_eq!(task.period(), Duration::from_millis(100)),
        other => panic!("expected a streaming timer, got {other:?}"),
    }
    let b = dashboard.sessions().get(B).expect("session b");
    assert!(!b.is_streaming());
    assert!(!b.is_recovering());
    assert!(b.stream_paused());
}

#[tokio::test]
async fn agent_log_lines_are_kept_per_session() {
    let agent = FakeAgent::new();
    let (mut dashboard, mut events) = connected(&agent, A).await;
    agent.push(A, r#"{"type":"log","data":"clicked submit"}"#);
    pump_until(&mut dashboard, &mut events, |d| {
        d.sessions().get(A).is_some_and(|s| !s.logs().is_empty())
    })
    .await;
    let session = dashboard.sessions().get(A).expect("session");
    assert_eq!(session.logs(), ["clicked submit".to_string()]);
}

#[tokio::test]
async fn connection_paths_follow_selection_and_assist_binding() {
    let agent = FakeAgent::new();
    let (mut dashboard, mut events) = connected(&agent, A).await;

    let mut sessions = BTreeMap::new();
    sessions.insert(A.to_string(), Rect::new(400.0, 200.0, 300.0, 200.0));
    let mut task_cards = BTreeMap::new();
    task_cards.insert("t1".to_string(), Rect::new(0.0, 100.0, 200.0, 80.0));
    let layout = LayoutSnapshot {
        viewport_width: 1400.0,
        sidebar_open: false,
        anchor: Rect::new(20.0, 600.0, 200.0, 40.0),
        bounds: Rect::new(300.0, 50.0, 1000.0, 700.0),
        sessions,
        task_cards,
        task_list: Rect::new(0.0, 80.0, 220.0, 400.0),
    };

    let paths = dashboard.connection_paths(&layout).expect("paths");
    let route = paths.session_route.expect("route to selected session");
    assert_eq!(route.segments(), 5);
    assert!(paths.assist_segment.is_none());

    agent.push_task(A, "t1", "in-progress", "job");
    pump_until(&mut dashboard, &mut events, |d| {
        status(d, "t1") == Some(TaskStatus::InProgress)
    })
    .await;
    dashboard.activate_assist("t1").expect("activate");
    let paths = dashboard.connection_paths(&layout).expect("paths");
    let segment = paths.assist_segment.expect("assist segment");
    assert_eq!(segment.segments(), 1);

    let mut broken = layout.clone();
    broken.anchor.width = f64::NAN;
    assert!(dashboard.connection_paths(&broken).is_err());
}
