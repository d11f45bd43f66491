//! Postgres LISTEN/NOTIFY notification source.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};

use super::{ListenError, Notification, NotificationSource, NotificationStream};

/// Notification source backed by Postgres `LISTEN`.
///
/// Each `connect` call checks out a dedicated connection (autocommit, never
/// shared with the transactional query path) and issues one `LISTEN` per
/// channel. `PgListener` quotes channel identifiers, which matters: unquoted
/// identifiers get case-folded by the server, and target-system channel names
/// are case-sensitive.
#[derive(Debug, Clone)]
pub struct PgNotificationSource {
    pool: PgPool,
}

impl PgNotificationSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn connect(
        &self,
        channels: &[String],
    ) -> Result<Box<dyn NotificationStream>, ListenError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| ListenError::Subscribe(e.to_string()))?;

        listener
            .listen_all(channels.iter().map(String::as_str))
            .await
            .map_err(|e| ListenError::Subscribe(e.to_string()))?;

        Ok(Box::new(PgNotificationStream { listener }))
    }
}

struct PgNotificationStream {
    listener: PgListener,
}

#[async_trait]
impl NotificationStream for PgNotificationStream {
    async fn recv(&mut self) -> Result<Notification, ListenError> {
        // try_recv (unlike recv) surfaces connection loss instead of silently
        // reconnecting; the collector owns the reconnect/resubscribe policy.
        match self.listener.try_recv().await {
            Ok(Some(n)) => Ok(Notification {
                channel: n.channel().to_string(),
                payload: n.payload().to_string(),
            }),
            Ok(None) => Err(ListenError::Connection("connection closed".to_string())),
            Err(e) => Err(ListenError::Connection(e.to_string())),
        }
    }
}
