//! Completion bus.
//!
//! Collaborators post their asynchronous results here; the control loop is
//! the only reader. Each producer registers for the topic it publishes on and
//! receives a [`CompletionSink`]. All sinks share the lifetime of one
//! [`Subscriptions`] set: closing it (explicitly or on drop) detaches every
//! sink at once, and anything posted afterwards is dropped and logged.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use anchorsync_core::{CompletionChannel, HostInput, LocalizationEvent, SessionEvent, StorageCompletion};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a sink is allowed to post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Storage(CompletionChannel),
    Localization,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(channel) => write!(f, "storage/{channel:?}"),
            Self::Localization => f.write_str("localization"),
        }
    }
}

/// Sender for host input. Inputs are not subscriptions; they stop being
/// delivered once the control loop has exited.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSender {
    /// Send an event to the control loop. If it fails, we swallow the error
    /// and log it.
    pub fn send(&self, event: SessionEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::error!("failed to send event: {e}");
        }
    }

    pub fn input(&self, input: HostInput) {
        self.send(SessionEvent::Input(input));
    }
}

/// Producer handle for one topic.
#[derive(Debug, Clone)]
pub struct CompletionSink {
    topic: Topic,
    tx: mpsc::UnboundedSender<SessionEvent>,
    token: CancellationToken,
}

impl CompletionSink {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Post a storage completion. Returns whether it was enqueued.
    pub fn post_storage(&self, completion: StorageCompletion) -> bool {
        let expected = Topic::Storage(completion.channel());
        if self.topic != expected {
            tracing::warn!(
                topic = %self.topic,
                expected = %expected,
                "completion posted on the wrong topic, dropping"
            );
            return false;
        }
        self.post(SessionEvent::Storage(completion))
    }

    pub fn post_localization(&self, event: LocalizationEvent) -> bool {
        if self.topic != Topic::Localization {
            tracing::warn!(topic = %self.topic, "localization event posted on the wrong topic, dropping");
            return false;
        }
        self.post(SessionEvent::Localization(event))
    }

    fn post(&self, event: SessionEvent) -> bool {
        if self.token.is_cancelled() {
            tracing::debug!(topic = %self.topic, ?event, "subscription closed, dropping late completion");
            return false;
        }
        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(topic = %self.topic, "failed to post completion: {e}");
                false
            }
        }
    }
}

/// The set of live registrations. Closing it is idempotent.
#[derive(Debug, Default)]
pub struct Subscriptions {
    root: CancellationToken,
    topics: Mutex<Vec<Topic>>,
}

impl Subscriptions {
    fn track(&self, topic: Topic) -> CancellationToken {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(topic);
        self.root.child_token()
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn close(&self) {
        if self.root.is_cancelled() {
            return;
        }
        let topics = std::mem::take(&mut *self.topics.lock().unwrap_or_else(PoisonError::into_inner));
        self.root.cancel();
        tracing::debug!(count = topics.len(), "closed completion subscriptions");
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct CompletionBus {
    tx: mpsc::UnboundedSender<SessionEvent>,
    subscriptions: Arc<Subscriptions>,
}

impl CompletionBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Self {
            tx,
            subscriptions: Arc::new(Subscriptions::default()),
        };
        (bus, rx)
    }

    pub fn register(&self, topic: Topic) -> CompletionSink {
        let token = self.subscriptions.track(topic);
        tracing::debug!(%topic, "registered completion sink");
        CompletionSink {
            topic,
            tx: self.tx.clone(),
            token,
        }
    }

    /// One sink per storage completion channel.
    pub fn register_storage(&self) -> StorageSinks {
        StorageSinks {
            create: self.register(Topic::Storage(CompletionChannel::CreateFromStorage)),
            publish: self.register(Topic::Storage(CompletionChannel::Publish)),
            query: self.register(Topic::Storage(CompletionChannel::Query)),
            delete: self.register(Topic::Storage(CompletionChannel::Delete)),
        }
    }

    pub fn event_sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub fn subscriptions(&self) -> Arc<Subscriptions> {
        Arc::clone(&self.subscriptions)
    }

    pub fn close(&self) {
        self.subscriptions.close();
    }
}

/// Sinks for the four storage completion channels.
#[derive(Debug, Clone)]
pub struct StorageSinks {
    pub create: CompletionSink,
    pub publish: CompletionSink,
    pub query: CompletionSink,
    pub delete: CompletionSink,
}

impl StorageSinks {
    /// Route a completion to the sink for its channel.
    pub fn post(&self, completion: StorageCompletion) -> bool {
        let sink = match completion.channel() {
            CompletionChannel::CreateFromStorage => &self.create,
            CompletionChannel::Publish => &self.publish,
            CompletionChannel::Query => &self.query,
            CompletionChannel::Delete => &self.delete,
        };
        sink.post_storage(completion)
    }
}
