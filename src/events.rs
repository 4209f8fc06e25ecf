// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Event Surface
//!
//! A typed event bus for lifecycle and recovery signalling. Instead of a
//! globally shared emitter, an `EventBus` instance is threaded through every
//! collaborator; listeners attach through `subscribe` and receive a fan-out
//! copy of each event. Losing a listener (lagging or dropped receiver) never
//! blocks an emitter.

use tokio::sync::broadcast;

/// Severity carried by `BusEvent::Log` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by the bus and its managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A recovery pass started for failed transport state
    Recovering,
    /// The last recovery pass re-established all affected consumers
    Recovered,
    /// Recovery gave up after exhausting its retries
    RecoveryFailed { reason: String },
    /// A message left through `publish` or `send`
    MessagePublished {
        route_key: String,
        transaction_id: String,
    },
    QueueSubscribed { queue: String },
    QueueUnsubscribed { queue: String },
    SubscriptionCreated { queue: String },
    SubscriptionTagged { queue: String, consumer_tag: String },
    SubscriptionCleared { queue: String },
    SubscriptionRemoved { queue: String },
    SubscriptionBlocked { queue: String },
    SubscriptionUnblocked { queue: String },
    ConnectionCreated { name: String },
    ConnectionClosed { name: String },
    ConnectionError { name: String, error: String },
    ChannelCreated { name: String },
    ChannelClosed { name: String },
    Log { level: LogLevel, message: String },
}

/// Internal wake-up signals for the recovery coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum RecoverySignal {
    /// A broker connection reported an error or closed underneath us
    Connection(String),
    /// A channel's consumer stream terminated while still subscribed
    Channel(String),
}

/// Fan-out event bus shared by the facade and its managers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
    silence: bool,
}

impl EventBus {
    /// Creates a bus retaining up to `capacity` undelivered events per listener.
    pub fn new(capacity: usize, silence: bool) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, silence }
    }

    /// Attaches a listener. Each listener receives every subsequent event.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Emits an event to all listeners. A bus with no listeners drops the
    /// event silently.
    pub(crate) fn publish(&self, event: BusEvent) {
        let _ = self.sender.send(event);
    }

    /// Emits a `Log` event unless the bus was configured silent.
    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        if self.silence {
            return;
        }

        self.publish(BusEvent::Log {
            level,
            message: message.into(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(128, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listeners_receive_published_events() {
        let bus = EventBus::new(8, false);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(BusEvent::Recovering);

        assert_eq!(first.recv().await.unwrap(), BusEvent::Recovering);
        assert_eq!(second.recv().await.unwrap(), BusEvent::Recovering);
    }

    #[tokio::test]
    async fn publishing_without_listeners_does_not_panic() {
        let bus = EventBus::new(8, false);
        bus.publish(BusEvent::Recovered);
    }

    #[tokio::test]
    async fn silence_suppresses_log_events_only() {
        let bus = EventBus::new(8, true);
        let mut listener = bus.subscribe();

        bus.log(LogLevel::Info, "hidden");
        bus.publish(BusEvent::Recovering);

        assert_eq!(listener.recv().await.unwrap(), BusEvent::Recovering);
    }

    #[tokio::test]
    async fn log_events_carry_level_and_message() {
        let bus = EventBus::new(8, false);
        let mut listener = bus.subscribe();

        bus.log(LogLevel::Warn, "queue drained");

        assert_eq!(
            listener.recv().await.unwrap(),
            BusEvent::Log {
                level: LogLevel::Warn,
                message: "queue drained".to_owned()
            }
        );
    }
}
