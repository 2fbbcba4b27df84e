//! In-process trigger layer.
//!
//! Stores publish `TriggerEvent`s on an `EventBus`; `Triggers::run` drains
//! the bus and handles every event on its own task. Handlers can also be
//! called directly, in which case they complete before returning.

use crate::{
    errors::PipelineError,
    models::{
        document::DocumentRef,
        event::{DocumentCreatedEvent, StorageObjectEvent, TriggerEvent},
    },
    services::{
        blob_stream::ObjectStore,
        counter::{CounterError, CounterTransaction},
        event_filter::{EventFilter, FilterDecision},
        moderation::{ModerationOrchestrator, ModerationReport},
        storage_service::StorageError,
    },
};
use serde_json::Value;
use std::sync::Arc;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

/// Collection whose document creations count as completed moves.
pub const MOVES_COLLECTION: &str = "completedMoves";
/// Field of a move record naming the user who moved.
pub const MOVER_FIELD: &str = "mover";
/// Collection holding one counter document per user.
pub const USERS_COLLECTION: &str = "users";
pub const MOVES_COUNT_FIELD: &str = "movesCount";

/// What to do when a counter transaction runs out of attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ExhaustionPolicy {
    /// Fail the invocation with the conflict error.
    #[default]
    Fail,
    /// Log a warning and complete the invocation.
    Warn,
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: UnboundedSender<TriggerEvent>,
}

impl EventBus {
    pub fn channel() -> (Self, UnboundedReceiver<TriggerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: TriggerEvent) {
        if self.tx.send(event).is_err() {
            warn!("trigger dispatcher stopped; dropping event");
        }
    }
}

#[derive(Clone)]
pub struct Triggers {
    store: Arc<dyn ObjectStore>,
    filter: EventFilter,
    orchestrator: ModerationOrchestrator,
    counter: CounterTransaction,
    exhaustion: ExhaustionPolicy,
}

impl Triggers {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        filter: EventFilter,
        orchestrator: ModerationOrchestrator,
        counter: CounterTransaction,
        exhaustion: ExhaustionPolicy,
    ) -> Self {
        Self {
            store,
            filter,
            orchestrator,
            counter,
            exhaustion,
        }
    }

    /// Moderate and thumbnail a newly written image.
    ///
    /// Returns `Ok(None)` when the event is filtered out, either as delivered
    /// or after re-reading the object's current state.
    pub async fn on_storage_object_change(
        &self,
        event: &StorageObjectEvent,
    ) -> Result<Option<ModerationReport>, PipelineError> {
        if let FilterDecision::Reject(reason) = self.filter.evaluate(event) {
            debug!(bucket = %event.bucket, path = %event.path, ?reason, "event skipped");
            return Ok(None);
        }

        let current = match self.store.stat(&event.bucket, &event.path).await {
            Ok(object) => object,
            Err(StorageError::ObjectNotFound { .. }) => {
                debug!(bucket = %event.bucket, path = %event.path, "object gone before processing");
                return Ok(None);
            }
            Err(err) => {
                error!(bucket = %event.bucket, path = %event.path, error = %err, "stat failed");
                return Err(err.into());
            }
        };
        let fresh = StorageObjectEvent::from_object(&event.bucket, &current, event.resource_state);
        if let FilterDecision::Reject(reason) = self.filter.evaluate(&fresh) {
            debug!(
                bucket = %event.bucket,
                path = %event.path,
                ?reason,
                "object already handled, skipping re-delivery"
            );
            return Ok(None);
        }

        self.orchestrator.run(&fresh).await.map(Some)
    }

    /// Count a completed move against its mover.
    ///
    /// Returns the new counter value, or `None` when exhaustion is tolerated
    /// by the configured policy.
    pub async fn on_move_record_created(
        &self,
        event: &DocumentCreatedEvent,
    ) -> Result<Option<i64>, PipelineError> {
        let mover = match event.fields.get(MOVER_FIELD) {
            Some(Value::String(id)) if !id.trim().is_empty() => id.as_str(),
            _ => {
                error!(document = %event.document, "move record without a mover");
                return Err(PipelineError::InvalidMoveRecord(event.document.to_string()));
            }
        };

        let user = DocumentRef::new(USERS_COLLECTION, mover);
        match self.counter.increment(&user).await {
            Ok(value) => {
                info!(document = %user, moves = value, "move counted");
                Ok(Some(value))
            }
            Err(err @ CounterError::TransactionConflict { .. })
                if self.exhaustion == ExhaustionPolicy::Warn =>
            {
                warn!(document = %user, error = %err, "move not counted");
                Ok(None)
            }
            Err(err) => {
                error!(document = %user, error = %err, "counter update failed");
                Err(err.into())
            }
        }
    }

    async fn dispatch(&self, event: TriggerEvent) {
        match event {
            TriggerEvent::StorageObjectChange(event) => {
                // Failures are logged by the orchestrator.
                let _ = self.on_storage_object_change(&event).await;
            }
            TriggerEvent::DocumentCreated(event) if event.document.collection == MOVES_COLLECTION => {
                let _ = self.on_move_record_created(&event).await;
            }
            TriggerEvent::DocumentCreated(event) => {
                debug!(document = %event.document, "no trigger for collection");
            }
        }
    }

    /// Handle events until `shutdown` resolves or every publisher is
    /// dropped, then wait for the in-flight handlers.
    ///
    /// On shutdown the bus is closed and events already queued are still
    /// handled. Events published after that are refused by the bus.
    pub async fn run<S>(self: Arc<Self>, mut events: UnboundedReceiver<TriggerEvent>, shutdown: S)
    where
        S: Future<Output = ()> + Send,
    {
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    events.close();
                    let mut queued = 0usize;
                    while let Some(event) = events.recv().await {
                        queued += 1;
                        self.spawn_dispatch(&mut tasks, event);
                    }
                    if queued > 0 {
                        info!(queued, "handling events queued before shutdown");
                    }
                    break;
                }
                next = events.recv() => match next {
                    Some(event) => self.spawn_dispatch(&mut tasks, event),
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "trigger task panicked");
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "trigger task panicked");
            }
        }
        info!("trigger dispatcher stopped");
    }

    fn spawn_dispatch(self: &Arc<Self>, tasks: &mut JoinSet<()>, event: TriggerEvent) {
        let triggers = self.clone();
        tasks.spawn(async move { triggers.dispatch(event).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::document::Fields;
    use serde_json::json;

    #[tokio::test]
    async fn publish_after_receiver_dropped_does_not_panic() {
        let (bus, rx) = EventBus::channel();
        drop(rx);
        bus.publish(TriggerEvent::DocumentCreated(DocumentCreatedEvent {
            document: DocumentRef::new(MOVES_COLLECTION, "m-1"),
            fields: Fields::new(),
        }));
    }

    #[tokio::test]
    async fn bus_delivers_in_publish_order() {
        let (bus, mut rx) = EventBus::channel();
        for id in ["a", "b"] {
            bus.publish(TriggerEvent::DocumentCreated(DocumentCreatedEvent {
                document: DocumentRef::new(MOVES_COLLECTION, id),
                fields: json!({"mover": id}).as_object().cloned().unwrap(),
            }));
        }
        drop(bus);

        let mut seen = Vec::new();
        while let Some(TriggerEvent::DocumentCreated(event)) = rx.recv().await {
            seen.push(event.document.id);
        }
        assert_eq!(seen, ["a", "b"]);
    }
}
