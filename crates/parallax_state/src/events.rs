//! # Script Events
//!
//! The core announces entity lifecycle to the scripting layer through
//! a narrow seam; the host decides how events reach resources.

use parking_lot::Mutex;

/// Fired when an inbound create built a new entity.
pub const EVENT_ENTITY_CREATED: &str = "entityCreated";

/// Fired when an entity's removal begins.
pub const EVENT_ENTITY_REMOVED: &str = "entityRemoved";

/// Sink for entity lifecycle events, carrying the script handle.
pub trait GameEventSink: Send + Sync {
    /// Queues a named event for main-thread dispatch.
    fn queue_event(&self, name: &str, script_handle: u32);
}

/// Discards every event.
pub struct NullEventSink;

impl GameEventSink for NullEventSink {
    fn queue_event(&self, _name: &str, _script_handle: u32) {}
}

/// Buffers events for inspection; used by hosts that batch-dispatch
/// and by tests.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(String, u32)>>,
}

impl RecordingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains everything queued so far.
    #[must_use]
    pub fn drain(&self) -> Vec<(String, u32)> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl GameEventSink for RecordingEventSink {
    fn queue_event(&self, name: &str, script_handle: u32) {
        self.events.lock().push((name.to_string(), script_handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_drains() {
        let sink = RecordingEventSink::new();
        sink.queue_event(EVENT_ENTITY_CREATED, 0x20001);
        sink.queue_event(EVENT_ENTITY_REMOVED, 0x20001);

        let events = sink.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], (EVENT_ENTITY_CREATED.to_string(), 0x20001));
        assert!(sink.drain().is_empty());
    }
}
