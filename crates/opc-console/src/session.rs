use crate::config::RECOVERY_INTERVAL;
use crate::error::{ConsoleError, ConsoleResult, TransportError};
use crate::event::ConsoleEvent;
use crate::scheduler::{ChannelTask, PeriodicTask};
use crate::transport::{Screenshot, SessionTransport};
use futures_util::StreamExt;
use opc_core::wire::{decode_push_frame, DEFAULT_MAX_FRAME_BYTES};
use opc_core::{ConnectivityState, FrameRate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const MAX_SESSION_LOG_LINES: usize = 500;

/// Which periodic loop, if any, a session is running. Holding the task in
/// the variant keeps image streaming and recovery probing mutually exclusive.
#[derive(Debug, Default)]
pub enum StreamTimer {
    #[default]
    Idle,
    Streaming(PeriodicTask),
    Recovering(PeriodicTask),
}

impl StreamTimer {
    pub fn is_streaming(&self) -> bool {
        matches!(self, StreamTimer::Streaming(_))
    }

    pub fn is_recovering(&self) -> bool {
        matches!(self, StreamTimer::Recovering(_))
    }

    fn streaming_generation(&self) -> Option<u64> {
        match self {
            StreamTimer::Streaming(task) => Some(task.generation()),
            _ => None,
        }
    }

    fn recovering_generation(&self) -> Option<u64> {
        match self {
            StreamTimer::Recovering(task) => Some(task.generation()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Session {
    address: String,
    state: ConnectivityState,
    channel: Option<ChannelTask>,
    timer: StreamTimer,
    image: Option<Screenshot>,
    logs: Vec<String>,
    stream_paused: bool,
    generation: u64,
}

impl Session {
    fn new(address: String) -> Self {
        Self {
            address,
            state: ConnectivityState::Connecting,
            channel: None,
            timer: StreamTimer::Idle,
            image: None,
            logs: Vec::new(),
            stream_paused: false,
            generation: 0,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectivityState::Connected
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn timer(&self) -> &StreamTimer {
        &self.timer
    }

    pub fn is_streaming(&self) -> bool {
        self.timer.is_streaming()
    }

    pub fn is_recovering(&self) -> bool {
        self.timer.is_recovering()
    }

    pub fn image(&self) -> Option<&Screenshot> {
        self.image.as_ref()
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn stream_paused(&self) -> bool {
        self.stream_paused
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn channel_generation(&self) -> Option<u64> {
        self.channel.as_ref().map(ChannelTask::generation)
    }

    fn push_log(&mut self, line: String) {
        self.logs.push(line);
        if self.logs.len() > MAX_SESSION_LOG_LINES {
            let overflow = self.logs.len() - MAX_SESSION_LOG_LINES;
            self.logs.drain(..overflow);
        }
    }
}

/// Owns every session together with its channel and periodic loops.
///
/// All methods run on the dashboard's event loop. Network work is spawned
/// and reports back through `events`.
pub struct SessionManager {
    sessions: Vec<Session>,
    transport: Arc<dyn SessionTransport>,
    events: mpsc::Sender<ConsoleEvent>,
    frame_rate: FrameRate,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        events: mpsc::Sender<ConsoleEvent>,
        frame_rate: FrameRate,
    ) -> Self {
        Self {
            sessions: Vec::new(),
            transport,
            events,
            frame_rate,
        }
    }

    pub fn frame_rate(&self) -> FrameRate {
        self.frame_rate
    }

    pub fn get(&self, address: &str) -> Option<&Session> {
        self.sessions.iter().find(|session| session.address == address)
    }

    fn get_mut(&mut self, address: &str) -> Option<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|session| session.address == address)
    }

    fn require_mut(&mut self, address: &str) -> ConsoleResult<&mut Session> {
        self.get_mut(address)
            .ok_or_else(|| ConsoleError::UnknownSession(address.to_string()))
    }

    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    pub fn state(&self, address: &str) -> Option<ConnectivityState> {
        self.get(address).map(Session::state)
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn position(&self, address: &str) -> Option<usize> {
        self.sessions
            .iter()
            .position(|session| session.address == address)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Lookup-or-create. Returns `true` when a new session was created and
    /// its channel opened; an existing session is left untouched.
    pub fn connect(&mut self, address: &str) -> bool {
        if self.contains(address) {
            debug!(event = "session_exists", session = %address);
            return false;
        }
        info!(event = "session_created", session = %address);
        self.sessions.push(Session::new(address.to_string()));
        self.open_channel(address);
        true
    }

    /// Makes sure a session exists and is on its way to `connected`.
    /// A session already recovering is left to its probe.
    pub fn ensure_connecting(&mut self, address: &str) {
        let idle = match self.get(address) {
            None => {
                self.connect(address);
                return;
            }
            Some(session) => !session.has_channel() && !session.is_recovering(),
        };
        if idle {
            self.open_channel(address);
        }
    }

    pub fn reconnect(&mut self, address: &str) -> ConsoleResult<()> {
        let session = self.require_mut(address)?;
        session.channel = None;
        session.timer = StreamTimer::Idle;
        info!(event = "session_reconnect", session = %address);
        self.open_channel(address);
        Ok(())
    }

    /// Stops channel, streaming and recovery. The session stays listed as
    /// disconnected until reconnected or closed.
    pub fn disconnect(&mut self, address: &str) -> ConsoleResult<()> {
        let session = self.require_mut(address)?;
        session.channel = None;
        session.timer = StreamTimer::Idle;
        session.image = None;
        session.state = ConnectivityState::Disconnected;
        info!(event = "session_disconnected", session = %address);
        Ok(())
    }

    /// Removes the session. Its channel and timers are aborted as the
    /// session is dropped.
    pub fn close(&mut self, address: &str) -> ConsoleResult<()> {
        let idx = self
            .position(address)
            .ok_or_else(|| ConsoleError::UnknownSession(address.to_string()))?;
        self.sessions.remove(idx);
        info!(event = "session_closed", session = %address);
        Ok(())
    }

    pub fn on_channel_opened(&mut self, address: &str, generation: u64) -> bool {
        let Some(session) = self.get_mut(address) else {
            return false;
        };
        if session.channel_generation() != Some(generation) {
            debug!(event = "stale_channel_open", session = %address, generation);
            return false;
        }
        session.state = ConnectivityState::Connected;
        if session.is_recovering() {
            session.timer = StreamTimer::Idle;
        }
        let start_stream = !session.is_streaming() && !session.stream_paused;
        info!(event = "channel_open", session = %address);
        if start_stream {
            self.start_stream(address);
        }
        true
    }

    pub fn on_channel_closed(&mut self, address: &str, generation: u64) -> bool {
        let Some(session) = self.get_mut(address) else {
            return false;
        };
        if session.channel_generation() != Some(generation) {
            debug!(event = "stale_channel_close", session = %address, generation);
            return false;
        }
        session.channel = None;
        session.timer = StreamTimer::Idle;
        session.image = None;
        session.state = ConnectivityState::Disconnected;
        info!(event = "channel_lost", session = %address);
        self.start_recovery(address);
        true
    }

    pub fn accepts_push(&self, address: &str, generation: u64) -> bool {
        self.get(address)
            .is_some_and(|session| session.channel_generation() == Some(generation))
    }

    pub fn on_probe_succeeded(&mut self, address: &str, generation: u64) -> bool {
        let Some(session) = self.get_mut(address) else {
            return false;
        };
        if session.timer.recovering_generation() != Some(generation) {
            return false;
        }
        session.timer = StreamTimer::Idle;
        info!(event = "session_reachable", session = %address);
        self.open_channel(address);
        true
    }

    /// Applies one image-loop result and returns the bytes to account.
    pub fn on_frame_fetched(
        &mut self,
        address: &str,
        generation: u64,
        result: Result<Screenshot, TransportError>,
    ) -> Option<u64> {
        let session = self.get_mut(address)?;
        if session.timer.streaming_generation() != Some(generation) {
            return None;
        }
        match result {
            Ok(image) => {
                let bytes = image.accounted_bytes();
                session.image = Some(image);
                Some(bytes)
            }
            Err(err) => {
                debug!(event = "frame_fetch_failed", session = %address, error = %err);
                session.image = None;
                None
            }
        }
    }

    pub fn on_captured(
        &mut self,
        address: &str,
        result: Result<Screenshot, TransportError>,
    ) -> Option<u64> {
        let session = self.get_mut(address)?;
        if !session.is_connected() {
            return None;
        }
        match result {
            Ok(image) => {
                let bytes = image.accounted_bytes();
                session.image = Some(image);
                Some(bytes)
            }
            Err(err) => {
                warn!(event = "capture_failed", session = %address, error = %err);
                None
            }
        }
    }

    pub fn push_log(&mut self, address: &str, line: String) {
        if let Some(session) = self.get_mut(address) {
            session.push_log(line);
        }
    }

    /// Restarts only the loops that are currently streaming.
    pub fn set_frame_rate(&mut self, frame_rate: FrameRate) {
        self.frame_rate = frame_rate;
        let streaming: Vec<String> = self
            .sessions
            .iter()
            .filter(|session| session.is_streaming())
            .map(|session| session.address.clone())
            .collect();
        for address in streaming {
            self.start_stream(&address);
        }
        info!(event = "frame_rate_set", fps = frame_rate.fps());
    }

    /// Pauses or resumes one session's image loop. Returns whether the
    /// session is streaming afterwards.
    pub fn toggle_stream(&mut self, address: &str) -> ConsoleResult<bool> {
        let session = self.require_mut(address)?;
        if session.is_streaming() {
            session.timer = StreamTimer::Idle;
            session.stream_paused = true;
            return Ok(false);
        }
        if !session.is_connected() {
            return Err(ConsoleError::PreconditionFailed(format!(
                "session {address} is {}",
                session.state
            )));
        }
        session.stream_paused = false;
        self.start_stream(address);
        Ok(true)
    }

    pub fn capture(&mut self, address: &str) -> ConsoleResult<()> {
        self.require_connected(address)?;
        let transport = self.transport.clone();
        let events = self.events.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            let result = transport.screenshot(&address).await;
            let _ = events.send(ConsoleEvent::Captured { address, result }).await;
        });
        Ok(())
    }

    pub fn mouse_click(&mut self, address: &str) -> ConsoleResult<()> {
        self.require_connected(address)?;
        let transport = self.transport.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            if let Err(err) = transport.mouse_click(&address).await {
                warn!(event = "mouse_click_failed", session = %address, error = %err);
            }
        });
        Ok(())
    }

    pub fn mouse_move(&mut self, address: &str, x: i32, y: i32) -> ConsoleResult<()> {
        self.require_connected(address)?;
        let transport = self.transport.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            if let Err(err) = transport.mouse_move(&address, x, y).await {
                warn!(event = "mouse_move_failed", session = %address, error = %err);
            }
        });
        Ok(())
    }

    fn require_connected(&self, address: &str) -> ConsoleResult<()> {
        match self.state(address) {
            None => Err(ConsoleError::UnknownSession(address.to_string())),
            Some(ConnectivityState::Connected) => Ok(()),
            Some(state) => Err(ConsoleError::PreconditionFailed(format!(
                "session {address} is {state}"
            ))),
        }
    }

    fn open_channel(&mut self, address: &str) {
        let transport = self.transport.clone();
        let events = self.events.clone();
        let Some(session) = self.get_mut(address) else {
            return;
        };
        let generation = session.next_generation();
        session.state = ConnectivityState::Connecting;
        let address = address.to_string();
        session.channel = Some(ChannelTask::spawn(
            generation,
            read_channel(transport, events, address, generation),
        ));
    }

    fn start_stream(&mut self, address: &str) {
        let transport = self.transport.clone();
        let events = self.events.clone();
        let period = self.frame_rate.interval();
        let Some(session) = self.get_mut(address) else {
            return;
        };
        let generation = session.next_generation();
        let address = address.to_string();
        // Replacing the variant drops (and aborts) any previous timer.
        session.timer = StreamTimer::Streaming(PeriodicTask::spawn(
            generation,
            Duration::ZERO,
            period,
            move || {
                let transport = transport.clone();
                let events = events.clone();
                let address = address.clone();
                async move {
                    let result = transport.screenshot(&address).await;
                    events
                        .send(ConsoleEvent::FrameFetched {
                            address,
                            generation,
                            result,
                        })
                        .await
                        .is_ok()
                }
            },
        ));
    }

    fn start_recovery(&mut self, address: &str) {
        let transport = self.transport.clone();
        let events = self.events.clone();
        let Some(session) = self.get_mut(address) else {
            return;
        };
        let generation = session.next_generation();
        let address = address.to_string();
        session.timer = StreamTimer::Recovering(PeriodicTask::spawn(
            generation,
            RECOVERY_INTERVAL,
            RECOVERY_INTERVAL,
            move || {
                let transport = transport.clone();
                let events = events.clone();
                let address = address.clone();
                async move {
                    match transport.ping(&address).await {
                        Ok(()) => {
                            let _ = events
                                .send(ConsoleEvent::ProbeSucceeded {
                                    address,
                                    generation,
                                })
                                .await;
                            false
                        }
                        Err(err) => {
                            debug!(event = "probe_failed", session = %address, error = %err);
                            true
                        }
                    }
                }
            },
        ));
    }
}

async fn read_channel(
    transport: Arc<dyn SessionTransport>,
    events: mpsc::Sender<ConsoleEvent>,
    address: String,
    generation: u64,
) {
    let mut frames = match transport.open_channel(&address).await {
        Ok(frames) => frames,
        Err(err) => {
            let _ = events
                .send(ConsoleEvent::ChannelClosed {
                    address,
                    generation,
                    error: Some(err.to_string()),
                })
                .await;
            return;
        }
    };
    if events
        .send(ConsoleEvent::ChannelOpened {
            address: address.clone(),
            generation,
        })
        .await
        .is_err()
    {
        return;
    }

    let mut error = None;
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(text) => match decode_push_frame(&text, DEFAULT_MAX_FRAME_BYTES) {
                Ok(event) => {
                    let sent = events
                        .send(ConsoleEvent::Push {
                            address: address.clone(),
                            generation,
                            event,
                        })
                        .await;
                    if sent.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(event = "push_frame_dropped", session = %address, error = %err);
                }
            },
            Err(err) => {
                error = Some(err.to_string());
                break;
            }
        }
    }
    let _ = events
        .send(ConsoleEvent::ChannelClosed {
            address,
            generation,
            error,
        })
        .await;
}
