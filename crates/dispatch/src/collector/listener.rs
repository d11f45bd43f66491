//! Live collector: near-real-time tailing of change-log push notifications.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use campusidm_core::{EventId, TargetSystem};
use campusidm_events::Envelope;

use crate::changelog::{ChangeLog, ChangeLogError};
use crate::notify::{Notification, NotificationSource, NotificationStream};
use crate::queue::{EventQueue, PushError};
use crate::runstate::RunState;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Channels to subscribe to, passed verbatim to the source.
    pub channels: Vec<String>,

    /// Bounded wait for the next notification; doubles as the run-state poll
    /// interval, so it also bounds shutdown latency.
    pub poll_timeout: Duration,

    /// Fixed backoff after a failed subscribe or a lost connection. No
    /// growth, no circuit breaker; retried unboundedly.
    pub reconnect_delay: Duration,

    /// Short wait used to drain the rest of a notification burst after the
    /// first one arrives.
    pub drain_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            poll_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(100),
        }
    }
}

/// Tails the change log's push notifications and forwards fully-resolved
/// events to the shared queue.
///
/// Lifecycle: disconnected -> subscribed -> (wait <-> draining) ->
/// disconnected on error, with a fixed-delay reconnect+resubscribe. A
/// transient database error never exits the loop; only a stopped run state
/// does.
pub struct LiveCollector {
    target: TargetSystem,
    source: Arc<dyn NotificationSource>,
    changelog: Arc<dyn ChangeLog>,
    queue: EventQueue,
    run_state: RunState,
    config: ListenerConfig,
}

impl LiveCollector {
    pub fn new(
        target: TargetSystem,
        source: Arc<dyn NotificationSource>,
        changelog: Arc<dyn ChangeLog>,
        queue: EventQueue,
        run_state: RunState,
        config: ListenerConfig,
    ) -> Self {
        Self {
            target,
            source,
            changelog,
            queue,
            run_state,
            config,
        }
    }

    pub async fn run(self) {
        info!(target_system = %self.target, channels = ?self.config.channels, "live collector started");

        let mut stream: Option<Box<dyn NotificationStream>> = None;

        while self.run_state.is_running() {
            if stream.is_none() {
                match self.source.connect(&self.config.channels).await {
                    Ok(s) => {
                        info!(target_system = %self.target, "subscribed to notification channels");
                        stream = Some(s);
                    }
                    Err(e) => {
                        warn!(target_system = %self.target, error = %e, "unable to subscribe");
                        sleep(self.config.reconnect_delay).await;
                        continue;
                    }
                }
            }
            let Some(s) = stream.as_mut() else { continue };

            let lost = match timeout(self.config.poll_timeout, s.recv()).await {
                // Nothing arrived within the bounded wait; loop to re-check
                // the run state.
                Err(_) => false,
                Ok(Err(e)) => {
                    warn!(target_system = %self.target, error = %e, "notification connection lost");
                    true
                }
                Ok(Ok(first)) => {
                    self.handle_notification(first).await;
                    self.drain(s.as_mut()).await
                }
            };

            if lost {
                stream = None;
                sleep(self.config.reconnect_delay).await;
            }
        }

        info!(target_system = %self.target, "live collector stopped");
    }

    /// Forward every notification buffered behind the first one, in arrival
    /// order. Returns true if the connection was lost while draining.
    async fn drain(&self, stream: &mut dyn NotificationStream) -> bool {
        loop {
            match timeout(self.config.drain_timeout, stream.recv()).await {
                Err(_) => return false,
                Ok(Err(e)) => {
                    warn!(target_system = %self.target, error = %e, "notification connection lost");
                    return true;
                }
                Ok(Ok(n)) => self.handle_notification(n).await,
            }
        }
    }

    /// Resolve a notification payload into the full event and enqueue it.
    ///
    /// Malformed payloads and fetch failures skip the single item; the
    /// backfill sweep is the backstop for anything skipped here.
    async fn handle_notification(&self, notification: Notification) {
        debug!(
            target_system = %self.target,
            channel = %notification.channel,
            payload = %notification.payload,
            "notification received"
        );

        let id: EventId = match notification.payload.parse() {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    channel = %notification.channel,
                    payload = %notification.payload,
                    error = %e,
                    "malformed notification payload; skipping"
                );
                return;
            }
        };

        let event = match self.changelog.get_event(id).await {
            Ok(event) => event,
            Err(ChangeLogError::NotFound(_)) => {
                warn!(event_id = %id, "notification referenced unknown event; skipping");
                return;
            }
            Err(e) => {
                warn!(event_id = %id, error = %e, "unable to fetch event; leaving it to the sweep");
                return;
            }
        };

        // Bounded pushes with a run-state check between attempts, so a full
        // queue never blocks shutdown.
        let mut envelope = Envelope::new(self.target.clone(), event);
        loop {
            if !self.run_state.is_running() {
                return;
            }
            match self
                .queue
                .push_timeout(envelope, self.config.poll_timeout)
                .await
            {
                Ok(()) => return,
                Err(PushError::Full(returned)) => envelope = returned,
                Err(PushError::Closed) => {
                    warn!(event_id = %id, "event queue closed; dropping envelope");
                    return;
                }
            }
        }
    }
}
