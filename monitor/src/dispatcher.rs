//! Turns notifications into status records.
//!
//! Each notification goes through four steps:
//!
//! 1. **classify**: look up the subscription type in the registry
//! 2. **decode**: run the registered decoder on the raw event body
//! 3. **project**: fold the decoded event into the current record
//! 4. **emit**: hand the record to the sink, once per notification
//!
//! Adding a category is one [`DecoderRegistry::register`] call plus a
//! projection arm.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::events::{ChatMessageEvent, ResubMessageEvent, SubscribeEvent};
use crate::output::{OutputError, StatusRecord, StatusSink};
use crate::types::{Notification, SubscriptionKind};

/// Errors from decoding an event body.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The body does not match the shape registered for its type.
    #[error("payload for {subscription_type} does not match its schema: {source}")]
    Schema {
        subscription_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// No decoder is registered for the type.
    #[error("no decoder registered for {0}")]
    Unregistered(String),
}

/// Errors from dispatching a notification.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Output(#[from] OutputError),
}

/// Category of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChatMessage,
    Subscribe,
    ResubMessage,
    Unknown,
}

impl From<SubscriptionKind> for EventKind {
    fn from(kind: SubscriptionKind) -> Self {
        match kind {
            SubscriptionKind::ChatMessage => Self::ChatMessage,
            SubscriptionKind::ChannelSubscribe => Self::Subscribe,
            SubscriptionKind::SubscriptionMessage => Self::ResubMessage,
        }
    }
}

/// A decoded event body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    ChatMessage(ChatMessageEvent),
    Subscribe(SubscribeEvent),
    ResubMessage(ResubMessageEvent),
}

/// Turns a raw event body into a [`DecodedEvent`].
pub type Decoder = fn(Value) -> Result<DecodedEvent, serde_json::Error>;

fn decode_chat_message(event: Value) -> Result<DecodedEvent, serde_json::Error> {
    serde_json::from_value(event).map(DecodedEvent::ChatMessage)
}

fn decode_subscribe(event: Value) -> Result<DecodedEvent, serde_json::Error> {
    serde_json::from_value(event).map(DecodedEvent::Subscribe)
}

fn decode_resub_message(event: Value) -> Result<DecodedEvent, serde_json::Error> {
    serde_json::from_value(event).map(DecodedEvent::ResubMessage)
}

/// Maps subscription type strings to their kind and decoder.
#[derive(Debug, Clone, Default)]
pub struct DecoderRegistry {
    entries: HashMap<String, (EventKind, Decoder)>,
}

impl DecoderRegistry {
    /// An empty registry: every notification classifies as `Unknown`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry for the three built-in categories.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            SubscriptionKind::ChatMessage.as_str(),
            EventKind::ChatMessage,
            decode_chat_message,
        );
        registry.register(
            SubscriptionKind::ChannelSubscribe.as_str(),
            EventKind::Subscribe,
            decode_subscribe,
        );
        registry.register(
            SubscriptionKind::SubscriptionMessage.as_str(),
            EventKind::ResubMessage,
            decode_resub_message,
        );
        registry
    }

    /// Registers (or replaces) the decoder for `subscription_type`.
    pub fn register(&mut self, subscription_type: impl Into<String>, kind: EventKind, decoder: Decoder) {
        self.entries.insert(subscription_type.into(), (kind, decoder));
    }

    /// Classifies a notification by its subscription type.
    #[must_use]
    pub fn classify(&self, notification: &Notification) -> EventKind {
        self.entries
            .get(notification.subscription.subscription_type.as_str())
            .map_or(EventKind::Unknown, |(kind, _)| *kind)
    }

    /// Decodes a notification's event body.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Unregistered`] for unknown types and
    /// [`DecodeError::Schema`] if the body does not fit the decoder.
    pub fn decode(&self, notification: &Notification) -> Result<DecodedEvent, DecodeError> {
        let subscription_type = &notification.subscription.subscription_type;
        let (_, decoder) = self
            .entries
            .get(subscription_type.as_str())
            .ok_or_else(|| DecodeError::Unregistered(subscription_type.clone()))?;

        decoder(notification.event.clone()).map_err(|source| DecodeError::Schema {
            subscription_type: subscription_type.clone(),
            source,
        })
    }
}

/// Folds `event` into `record`, returning the new record.
#[must_use]
pub fn project(record: &StatusRecord, event: &DecodedEvent) -> StatusRecord {
    let mut next = record.clone();
    match event {
        DecodedEvent::ChatMessage(chat) => {
            next.text.push_str(&chat.chatter_user_name);
            next.text.push_str(": ");
            next.text.push_str(&chat.message.text);
        }
        DecodedEvent::ResubMessage(resub) => {
            next.text.push_str("New Resub: ");
            next.text.push_str(&resub.user_name);
            next.text.push_str(": ");
            next.text.push_str(&resub.message.text);
            next.text.push('\n');
        }
        DecodedEvent::Subscribe(sub) => {
            next.tooltip.push_str("New sub: ");
            next.tooltip.push_str(&sub.user_name);
            next.tooltip.push('\n');
        }
    }
    next
}

/// Owns the current record and writes one record per notification.
pub struct EventDispatcher<S: StatusSink> {
    registry: DecoderRegistry,
    record: StatusRecord,
    sink: S,
}

impl<S: StatusSink> EventDispatcher<S> {
    pub fn new(registry: DecoderRegistry, sink: S) -> Self {
        Self {
            registry,
            record: StatusRecord::default(),
            sink,
        }
    }

    /// The last record emitted.
    #[must_use]
    pub fn record(&self) -> &StatusRecord {
        &self.record
    }

    /// The registry used for classification.
    #[must_use]
    pub fn registry(&self) -> &DecoderRegistry {
        &self.registry
    }

    /// Handles one notification.
    ///
    /// The text is reset, the event projected, and the record emitted.
    /// Unknown types still emit the reset record. A decode failure emits
    /// nothing and leaves the record unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Decode`] if the body does not decode and
    /// [`DispatchError::Output`] if the sink fails.
    pub fn dispatch(&mut self, notification: &Notification) -> Result<EventKind, DispatchError> {
        let kind = self.registry.classify(notification);

        let mut base = self.record.clone();
        base.text.clear();

        let next = match kind {
            EventKind::Unknown => {
                debug!(
                    subscription_type = %notification.subscription.subscription_type,
                    "Unhandled notification type"
                );
                base
            }
            _ => {
                let event = self.registry.decode(notification)?;
                project(&base, &event)
            }
        };

        self.sink.emit(&next)?;
        self.record = next;
        Ok(kind)
    }

    /// Returns the sink.
    pub fn into_sink(self) -> S {
        self.sink
    }
}
