use crate::error::TransportError;
use crate::transport::Screenshot;
use opc_core::wire::{CancelResponse, PushEvent, SubmitTaskResponse, UserAssistResponse};

/// Capacity of the queue feeding the dashboard's event loop.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Results reported back to the dashboard by spawned network work.
///
/// Session-scoped events carry the generation of the loop or channel that
/// produced them; the session manager drops any whose generation is no
/// longer current.
#[derive(Debug)]
pub enum ConsoleEvent {
    ChannelOpened {
        address: String,
        generation: u64,
    },
    ChannelClosed {
        address: String,
        generation: u64,
        error: Option<String>,
    },
    Push {
        address: String,
        generation: u64,
        event: PushEvent,
    },
    FrameFetched {
        address: String,
        generation: u64,
        result: Result<Screenshot, TransportError>,
    },
    ProbeSucceeded {
        address: String,
        generation: u64,
    },
    Captured {
        address: String,
        result: Result<Screenshot, TransportError>,
    },
    TaskSubmitted {
        address: String,
        placeholder: String,
        result: Result<SubmitTaskResponse, TransportError>,
    },
    CancelFinished {
        task_id: String,
        result: Result<CancelResponse, TransportError>,
    },
    AssistReplied {
        task_id: String,
        result: Result<UserAssistResponse, TransportError>,
    },
}

impl ConsoleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ConsoleEvent::ChannelOpened { .. } => "channel_opened",
            ConsoleEvent::ChannelClosed { .. } => "channel_closed",
            ConsoleEvent::Push { .. } => "push",
            ConsoleEvent::FrameFetched { .. } => "frame_fetched",
            ConsoleEvent::ProbeSucceeded { .. } => "probe_succeeded",
            ConsoleEvent::Captured { .. } => "captured",
            ConsoleEvent::TaskSubmitted { .. } => "task_submitted",
            ConsoleEvent::CancelFinished { .. } => "cancel_finished",
            ConsoleEvent::AssistReplied { .. } => "assist_replied",
        }
    }
}
