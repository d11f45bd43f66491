//! Push-notification source for the live path.
//!
//! The change log announces each committed event by firing a notification on
//! the target system's channel, with the event id as payload. This module is
//! the seam between the live collector and that mechanism: a source that
//! subscribes to a set of channels and yields notifications until the
//! connection is lost.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryNotificationSource;
pub use postgres::PgNotificationSource;

use async_trait::async_trait;
use thiserror::Error;

/// One push notification: the channel it arrived on and the raw payload
/// (an event id, for change-log notifications).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum ListenError {
    /// Could not open the push connection or issue the subscribe commands.
    #[error("unable to subscribe: {0}")]
    Subscribe(String),

    /// The push connection dropped mid-stream. The collector reconnects and
    /// resubscribes; the backfill sweep covers anything missed meanwhile.
    #[error("notification connection lost: {0}")]
    Connection(String),
}

/// Factory for live notification streams.
///
/// `connect` opens a fresh, dedicated push connection and subscribes to every
/// channel in `channels`. Channel names must reach the underlying mechanism
/// **verbatim**; implementations are responsible for quoting so that names
/// are not case-folded.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn connect(
        &self,
        channels: &[String],
    ) -> Result<Box<dyn NotificationStream>, ListenError>;
}

/// An open, subscribed push connection.
///
/// `recv` yields buffered notifications in strict arrival order and fails
/// with [`ListenError::Connection`] once the connection is gone; the stream
/// is useless afterwards and should be dropped.
#[async_trait]
pub trait NotificationStream: Send {
    async fn recv(&mut self) -> Result<Notification, ListenError>;
}
