pub mod wire;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BACKEND_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    InTheQueue,
    InProgress,
    Completed,
    Broken,
    #[serde(alias = "cancelled")]
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::InTheQueue => "in-the-queue",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Broken => "broken",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::InTheQueue => "In Queue",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::Completed => "Completed",
            TaskStatus::Broken => "Broken",
            TaskStatus::Canceled => "Canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Broken | TaskStatus::Canceled
        )
    }

    pub fn is_cancelable(&self) -> bool {
        matches!(self, TaskStatus::InTheQueue | TaskStatus::InProgress)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "in-the-queue" | "in_the_queue" | "queued" => Ok(TaskStatus::InTheQueue),
            "in-progress" | "in_progress" | "inprogress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "broken" => Ok(TaskStatus::Broken),
            "canceled" | "cancelled" => Ok(TaskStatus::Canceled),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Screenshot polling rate. Only the rates offered by the console are valid.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "u32", into = "u32")]
pub enum FrameRate {
    One,
    #[default]
    Five,
    Ten,
}

impl FrameRate {
    pub const ALL: [FrameRate; 3] = [FrameRate::One, FrameRate::Five, FrameRate::Ten];

    pub fn fps(&self) -> u32 {
        match self {
            FrameRate::One => 1,
            FrameRate::Five => 5,
            FrameRate::Ten => 10,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps()))
    }
}

impl TryFrom<u32> for FrameRate {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameRate::One),
            5 => Ok(FrameRate::Five),
            10 => Ok(FrameRate::Ten),
            other => Err(format!("unsupported frame rate: {other} (expected 1, 5 or 10)")),
        }
    }
}

impl From<FrameRate> for u32 {
    fn from(value: FrameRate) -> Self {
        value.fps()
    }
}

impl FromStr for FrameRate {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let value = input
            .trim()
            .trim_end_matches("fps")
            .trim()
            .parse::<u32>()
            .map_err(|err| format!("invalid frame rate '{input}': {err}"))?;
        FrameRate::try_from(value)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fps", self.fps())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("not a valid IPv4 or IPv6 address: {0}")]
    Invalid(String),
}

/// Normalizes operator input into a session address: IPv4 literals are kept
/// as-is, IPv6 literals are wrapped in brackets so `host:port` stays unambiguous.
pub fn parse_session_address(input: &str) -> Result<String, AddressError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }
    if trimmed.parse::<Ipv4Addr>().is_ok() {
        return Ok(trimmed.to_string());
    }
    let bare = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(trimmed);
    if bare.parse::<Ipv6Addr>().is_ok() {
        return Ok(format_address(bare));
    }
    Err(AddressError::Invalid(trimmed.to_string()))
}

pub fn format_address(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes < KB {
        format!("{bytes} B")
    } else if bytes < MB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    }
}

/// Renders a task timer as `DD:HH:MM:SS:mmm`.
pub fn format_elapsed(elapsed: chrono::Duration) -> String {
    let total_ms = elapsed.num_milliseconds().max(0);
    let days = total_ms / 86_400_000;
    let hours = (total_ms % 86_400_000) / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let seconds = (total_ms % 60_000) / 1_000;
    let millis = total_ms % 1_000;
    format!("{days:02}:{hours:02}:{minutes:02}:{seconds:02}:{millis:03}")
}
