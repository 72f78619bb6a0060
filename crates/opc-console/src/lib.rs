pub mod assist;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod event;
pub mod scheduler;
pub mod session;
pub mod tasks;
pub mod transport;
pub mod usage;

pub use assist::{Activation, AssistBinding, AssistMode, AssistState};
pub use config::{Endpoints, Preferences};
pub use dashboard::{
    ConnectionPaths, Dashboard, LayoutSnapshot, Notification, NotificationLevel, SendOutcome,
};
pub use error::{ConsoleError, ConsoleResult, TransportError};
pub use event::ConsoleEvent;
pub use session::{Session, SessionManager, StreamTimer};
pub use tasks::{ChangeKind, Task, TaskChange, TaskEngine};
pub use transport::{FrameStream, HttpTransport, Screenshot, SessionTransport};
pub use usage::NetworkUsage;
