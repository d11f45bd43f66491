use serde::{Deserialize, Serialize};

use campusidm_core::TargetSystem;

use crate::event::Event;

/// The unit of work placed on the dispatch queue.
///
/// An envelope pairs a fully-resolved event with the target system it should
/// be delivered to. A producer (live or backfill collector) creates it; a
/// single worker consumes and owns it until it reports success or failure
/// back to the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    channel: TargetSystem,
    event: Event,
}

impl Envelope {
    pub fn new(channel: TargetSystem, event: Event) -> Self {
        Self { channel, event }
    }

    pub fn channel(&self) -> &TargetSystem {
        &self.channel
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn into_event(self) -> Event {
        self.event
    }
}
