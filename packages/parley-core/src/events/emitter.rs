//! Event emitter abstraction for decoupling core components from transport.
//!
//! Components depend on the [`EventEmitter`] trait rather than concrete
//! broadcast channels, enabling testing and alternative delivery sinks.

use tokio::sync::broadcast;

use super::{BroadcastEvent, CallEvent, MediaEvent, TurnEvent};

/// Trait for emitting domain events without knowledge of transport.
///
/// # Example
///
/// ```ignore
/// struct MyService {
///     emitter: Arc<dyn EventEmitter>,
/// }
///
/// impl MyService {
///     fn do_something(&self) {
///         self.emitter.emit_call(CallEvent::Started { ... });
///     }
/// }
/// ```
pub trait EventEmitter: Send + Sync {
    /// Emits a call lifecycle event.
    fn emit_call(&self, event: CallEvent);

    /// Emits a conversational turn event.
    fn emit_turn(&self, event: TurnEvent);

    /// Emits a media-path health event.
    fn emit_media(&self, event: MediaEvent);
}

/// No-op emitter for tests and minimal deployments.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_call(&self, _event: CallEvent) {
        // No-op
    }

    fn emit_turn(&self, _event: TurnEvent) {
        // No-op
    }

    fn emit_media(&self, _event: MediaEvent) {
        // No-op
    }
}

/// Logging emitter for debugging and development.
///
/// Logs all events at debug level.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_call(&self, event: CallEvent) {
        tracing::debug!(?event, "call_event");
    }

    fn emit_turn(&self, event: TurnEvent) {
        tracing::debug!(?event, "turn_event");
    }

    fn emit_media(&self, event: MediaEvent) {
        tracing::debug!(?event, "media_event");
    }
}

/// Emitter that fans events out on a tokio broadcast channel.
///
/// The embedding application subscribes to receive everything; send errors
/// (no subscribers) are expected and ignored.
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<BroadcastEvent>,
}

impl BroadcastEventBridge {
    /// Creates a bridge around an existing broadcast sender.
    #[must_use]
    pub fn new(tx: broadcast::Sender<BroadcastEvent>) -> Self {
        Self { tx }
    }

    /// Subscribes to the underlying channel.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: BroadcastEvent) {
        // Err means no live subscribers; events are advisory.
        let _ = self.tx.send(event);
    }
}

impl EventEmitter for BroadcastEventBridge {
    fn emit_call(&self, event: CallEvent) {
        self.send(BroadcastEvent::Call(event));
    }

    fn emit_turn(&self, event: TurnEvent) {
        self.send(BroadcastEvent::Turn(event));
    }

    fn emit_media(&self, event: MediaEvent) {
        self.send(BroadcastEvent::Media(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Test emitter that counts events.
    struct CountingEventEmitter {
        call_count: AtomicUsize,
        turn_count: AtomicUsize,
    }

    impl CountingEventEmitter {
        fn new() -> Self {
            Self {
                call_count: AtomicUsize::new(0),
                turn_count: AtomicUsize::new(0),
            }
        }
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit_call(&self, _event: CallEvent) {
            self.call_count.fetch_add(1, Ordering::SeqCst);
        }

        fn emit_turn(&self, _event: TurnEvent) {
            self.turn_count.fetch_add(1, Ordering::SeqCst);
        }

        fn emit_media(&self, _event: MediaEvent) {}
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = Arc::new(CountingEventEmitter::new());

        emitter.emit_call(CallEvent::Started {
            call_id: "c1".to_string(),
            provider: "echo".to_string(),
            transport: "audiosocket".to_string(),
            timestamp: 0,
        });
        emitter.emit_turn(TurnEvent::Started {
            call_id: "c1".to_string(),
            turn_id: 1,
            timestamp: 0,
        });
        emitter.emit_turn(TurnEvent::Completed {
            call_id: "c1".to_string(),
            turn_id: 1,
            timestamp: 0,
        });

        assert_eq!(emitter.call_count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.turn_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn broadcast_bridge_delivers_to_subscribers() {
        let (tx, _) = broadcast::channel(16);
        let bridge = BroadcastEventBridge::new(tx);
        let mut rx = bridge.subscribe();

        bridge.emit_media(MediaEvent::PlaybackStalled {
            call_id: "c1".to_string(),
            stream_id: "s1".to_string(),
            timestamp: 0,
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            BroadcastEvent::Media(MediaEvent::PlaybackStalled { .. })
        ));
    }

    #[test]
    fn broadcast_bridge_without_subscribers_is_fine() {
        let (tx, rx) = broadcast::channel(16);
        drop(rx);
        let bridge = BroadcastEventBridge::new(tx);
        bridge.emit_call(CallEvent::Ended {
            call_id: "c1".to_string(),
            reason: "caller_hangup",
            duration_ms: 1000,
            timestamp: 0,
        });
    }
}
