//! Component result events
//!
//! Every pass of the Juggler reports each component's outcome as one
//! Kubernetes Event on the object that owns the component set (usually the
//! operator's own custom resource). Reasons are `<Component><Status>`, and
//! unhealthy or failed outcomes are Warnings.
//!
//! Publishing never fails the pass: a rejected event is logged and dropped.

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Upper bound on an event note; the events API rejects longer ones
pub const MAX_NOTE_BYTES: usize = 1024;

/// Sink for component result events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Report one outcome on `resource_ref`
    ///
    /// `reason` names the component and its status (e.g. `CertManagerInstalled`),
    /// `action` is the configured event action and `note` carries the result
    /// message when there is one.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Build the event for one outcome, cutting the note down to
/// [`MAX_NOTE_BYTES`] on a character boundary
pub fn component_event(type_: EventType, reason: &str, action: &str, note: Option<String>) -> Event {
    let note = note.map(|mut note| {
        if note.len() > MAX_NOTE_BYTES {
            let mut end = MAX_NOTE_BYTES;
            while !note.is_char_boundary(end) {
                end -= 1;
            }
            note.truncate(end);
        }
        note
    });
    Event {
        type_,
        reason: reason.to_string(),
        note,
        action: action.to_string(),
        secondary: None,
    }
}

/// Publishes through the events API with a `kube` `Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Publisher reporting as `controller`; `instance` identifies the replica
    /// (typically the pod name) when several run
    pub fn new(client: Client, controller: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = component_event(type_, reason, action, note);
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                object = ?resource_ref.name,
                error = %e,
                "dropping component event"
            );
        }
    }
}

/// Discards every event; the Juggler's default until a sink is attached
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// An event captured by [`CollectingEventPublisher`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Normal or Warning
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event action
    pub action: String,
    /// Event note
    pub note: Option<String>,
}

/// Publisher that keeps events in memory, for tests and dry runs.
#[derive(Default)]
pub struct CollectingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl CollectingEventPublisher {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl EventPublisher for CollectingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = component_event(type_, reason, action, note);
        let event = RecordedEvent {
            warning: matches!(event.type_, EventType::Warning),
            reason: event.reason,
            action: event.action,
            note: event.note,
        };
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
