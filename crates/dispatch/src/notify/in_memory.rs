//! In-memory notification source for tests and development.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ListenError, Notification, NotificationSource, NotificationStream};

type Feed = mpsc::UnboundedSender<Notification>;

#[derive(Default)]
struct Shared {
    streams: Mutex<Vec<Feed>>,
    subscriptions: Mutex<Vec<Vec<String>>>,
    fail_connects: AtomicUsize,
    connects: AtomicUsize,
}

/// Scriptable [`NotificationSource`]: tests push notifications in, and can
/// sever connections or make subscribe attempts fail to exercise the
/// collector's reconnect behavior.
#[derive(Clone, Default)]
pub struct InMemoryNotificationSource {
    shared: Arc<Shared>,
}

impl InMemoryNotificationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broadcast a notification to every connected stream, in call order.
    pub fn notify(&self, channel: impl Into<String>, payload: impl Into<String>) {
        let notification = Notification {
            channel: channel.into(),
            payload: payload.into(),
        };
        let streams = self.shared.streams.lock().unwrap();
        for feed in streams.iter() {
            let _ = feed.send(notification.clone());
        }
    }

    /// Sever every connected stream; their next `recv` reports a lost
    /// connection.
    pub fn disconnect_all(&self) {
        self.shared.streams.lock().unwrap().clear();
    }

    /// Make the next `n` connect attempts fail with a subscribe error.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    /// How many connects have succeeded (reconnects included).
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Channel sets recorded per successful connect.
    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.shared.subscriptions.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSource for InMemoryNotificationSource {
    async fn connect(
        &self,
        channels: &[String],
    ) -> Result<Box<dyn NotificationStream>, ListenError> {
        let remaining = self.shared.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.shared
                .fail_connects
                .store(remaining - 1, Ordering::SeqCst);
            return Err(ListenError::Subscribe("scripted failure".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.streams.lock().unwrap().push(tx);
        self.shared
            .subscriptions
            .lock()
            .unwrap()
            .push(channels.to_vec());
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(InMemoryNotificationStream { rx }))
    }
}

struct InMemoryNotificationStream {
    rx: mpsc::UnboundedReceiver<Notification>,
}

#[async_trait]
impl NotificationStream for InMemoryNotificationStream {
    async fn recv(&mut self) -> Result<Notification, ListenError> {
        match self.rx.recv().await {
            Some(n) => Ok(n),
            None => Err(ListenError::Connection("severed".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[tokio::test]
    async fn delivers_in_arrival_order() {
        let source = InMemoryNotificationSource::new();
        let mut stream = source.connect(&["Exchange".to_string()]).await.unwrap();

        source.notify("Exchange", "10");
        source.notify("Exchange", "11");

        assert_eq!(stream.recv().await.unwrap().payload, "10");
        assert_eq!(stream.recv().await.unwrap().payload, "11");
    }

    #[tokio::test]
    async fn severed_stream_reports_connection_loss() {
        let source = InMemoryNotificationSource::new();
        let mut stream = source.connect(&[]).await.unwrap();
        source.disconnect_all();

        let err = tokio::time::timeout(Duration::from_millis(100), stream.recv())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ListenError::Connection(_)));
    }

    #[tokio::test]
    async fn scripted_connect_failures_then_success() {
        let source = InMemoryNotificationSource::new();
        source.fail_next_connects(1);
        assert!(source.connect(&[]).await.is_err());
        assert!(source.connect(&[]).await.is_ok());
        assert_eq!(source.connect_count(), 1);
    }
}
