//! Actor loop that owns one entity instance and processes its commands.
//!
//! Each entity identity gets a tokio task that exclusively owns the
//! instance and its state, and processes messages from a bounded `mpsc`
//! channel one at a time. That is the only concurrency control an entity
//! needs: handlers never see two commands at once.
//!
//! The actor exits when its channel closes, a `Shutdown` message arrives,
//! or no message arrives within the idle timeout (passivation). Messages
//! already queued when it decides to exit are still processed.
//!
//! After every committed command the actor records the new state in the
//! shared [`StateStore`], so an actor spawned later for the same identity
//! resumes where the previous one stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::command::CommandContext;
use crate::error::RouterError;
use crate::provider::EntityContext;
use crate::registry::{ErasedComponent, ErasedInstance, ErasedState, Handled, Persist};

/// Identity of an entity: `(component_id, entity_id)`.
pub(crate) type EntityKey = (String, String);

/// Last committed state of every entity that has one, keyed by identity.
pub(crate) type StateStore = Arc<Mutex<HashMap<EntityKey, ErasedState>>>;

/// Configuration for the actor loop.
///
/// Internal to the crate; callers configure it through
/// [`HostBuilder`](crate::HostBuilder) and
/// [`ComponentOptions`](crate::ComponentOptions).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActorConfig {
    /// How long the actor waits for a message before passivating.
    pub idle_timeout: Duration,
    pub mailbox_capacity: usize,
}

type ExecuteResult = Result<Handled, RouterError>;

/// Messages sent from [`EntityHandle`] to the actor loop.
pub(crate) enum ActorMessage {
    Execute {
        ctx: CommandContext,
        payload: Value,
        reply: oneshot::Sender<ExecuteResult>,
    },
    /// Stop after the messages already queued.
    Shutdown,
}

/// Why a command did not produce a result.
#[derive(Debug)]
pub(crate) enum DeliveryError {
    /// The actor had already stopped accepting messages. The command was
    /// not processed and is handed back for a retry on a fresh actor.
    Undelivered { ctx: CommandContext, payload: Value },
    /// The actor accepted the command but exited without replying.
    Lost,
}

struct Actor {
    instance: Box<dyn ErasedInstance>,
    identity: EntityContext,
    key: EntityKey,
    store: StateStore,
}

async fn run_actor(mut actor: Actor, mut rx: mpsc::Receiver<ActorMessage>, config: ActorConfig) {
    let identity = actor.identity.clone();
    let entity_id = identity.entity_id.as_deref().unwrap_or_default();
    loop {
        match tokio::time::timeout(config.idle_timeout, rx.recv()).await {
            Ok(Some(ActorMessage::Execute {
                ctx,
                payload,
                reply,
            })) => {
                actor.execute(ctx, payload, reply).await;
            }
            Ok(Some(ActorMessage::Shutdown)) => {
                tracing::debug!(
                    component_id = %identity.component_id,
                    entity_id,
                    "actor shutting down"
                );
                break;
            }
            // Channel closed: all senders dropped.
            Ok(None) => break,
            Err(_elapsed) => {
                tracing::info!(
                    component_id = %identity.component_id,
                    entity_id,
                    "actor idle, shutting down"
                );
                break;
            }
        }
    }

    // Refuse new messages, then finish the ones already accepted.
    rx.close();
    while let Some(msg) = rx.recv().await {
        if let ActorMessage::Execute {
            ctx,
            payload,
            reply,
        } = msg
        {
            actor.execute(ctx, payload, reply).await;
        }
    }
}

impl Actor {
    async fn execute(
        &mut self,
        ctx: CommandContext,
        payload: Value,
        reply: oneshot::Sender<ExecuteResult>,
    ) {
        let span = tracing::info_span!(
            "command",
            component_id = %self.identity.component_id,
            entity_id = self.identity.entity_id.as_deref().unwrap_or_default(),
            command = %ctx.command_name,
        );
        let result = self.instance.handle(ctx, payload).instrument(span).await;

        if let Ok(handled) = &result {
            match &handled.commit {
                Some(Persist::Save(state)) => {
                    self.store
                        .lock()
                        .await
                        .insert(self.key.clone(), Arc::clone(state));
                }
                Some(Persist::Remove) => {
                    self.store.lock().await.remove(&self.key);
                }
                None => {}
            }
        }

        if reply.send(result).is_err() {
            tracing::warn!(
                component_id = %self.identity.component_id,
                "caller went away before the reply was sent"
            );
        }
    }
}

/// Async handle to a running entity actor.
///
/// Lightweight and cloneable. Communicates with the actor task over a
/// bounded channel.
#[derive(Debug, Clone)]
pub(crate) struct EntityHandle {
    sender: mpsc::Sender<ActorMessage>,
}

impl EntityHandle {
    /// Send a command to the actor and wait for the result.
    ///
    /// # Errors
    ///
    /// - [`DeliveryError::Undelivered`] if the actor no longer accepts
    ///   messages. The command is returned and was not processed.
    /// - [`DeliveryError::Lost`] if the actor exited before replying.
    pub(crate) async fn execute(
        &self,
        ctx: CommandContext,
        payload: Value,
    ) -> Result<ExecuteResult, DeliveryError> {
        let (tx, rx) = oneshot::channel();
        let msg = ActorMessage::Execute {
            ctx,
            payload,
            reply: tx,
        };
        if let Err(mpsc::error::SendError(msg)) = self.sender.send(msg).await {
            return Err(match msg {
                ActorMessage::Execute { ctx, payload, .. } => DeliveryError::Undelivered { ctx, payload },
                ActorMessage::Shutdown => DeliveryError::Lost,
            });
        }
        rx.await.map_err(|_| DeliveryError::Lost)
    }

    /// Ask the actor to stop once its queue is drained.
    pub(crate) async fn shutdown(&self) {
        // An actor that is already gone needs no shutdown.
        let _ = self.sender.send(ActorMessage::Shutdown).await;
    }

    /// Whether the actor is still accepting messages.
    ///
    /// Returns `false` once the actor has passivated or shut down. The
    /// host uses this to evict stale handles and spawn a fresh actor.
    pub(crate) fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Spawn an actor owning a new instance of `component`.
///
/// The instance resumes from the state recorded in `store` for its
/// identity, if any. The returned task handle completes once the actor
/// has exited and processed everything it accepted.
///
/// # Arguments
///
/// * `component` - The registered component to instantiate.
/// * `identity` - Component id and entity id of the actor.
/// * `store` - Last committed state per identity, shared by all actors.
/// * `config` - Idle timeout and mailbox capacity.
///
/// Must be called from within a tokio runtime.
pub(crate) async fn spawn_actor(
    component: &dyn ErasedComponent,
    identity: EntityContext,
    store: StateStore,
    config: ActorConfig,
) -> (EntityHandle, JoinHandle<()>) {
    let key = (
        identity.component_id.clone(),
        identity.entity_id.clone().unwrap_or_default(),
    );
    let restored = store.lock().await.get(&key).cloned();
    let actor = Actor {
        instance: component.spawn_instance(identity.clone(), restored),
        identity,
        key,
        store,
    };
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let task = tokio::spawn(run_actor(actor, rx, config));
    (EntityHandle { sender: tx }, task)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::component::test_fixtures::Counter;
    use crate::provider::Provider;
    use crate::registry::Registry;

    // `u64::MAX / 2` avoids overflow when tokio adds the timeout duration
    // to the current `Instant`.
    const NEVER: Duration = Duration::from_secs(u64::MAX / 2);

    fn counter_registry() -> Registry {
        Registry::new()
            .register(Provider::of(|ctx: &EntityContext| Counter {
                entity_id: ctx.entity_id.clone(),
            }))
            .expect("registration should succeed")
    }

    fn identity() -> EntityContext {
        EntityContext {
            component_id: "counter".into(),
            entity_id: Some("c-1".into()),
        }
    }

    async fn spawn_counter(idle_timeout: Duration) -> EntityHandle {
        let registry = counter_registry();
        let component = registry.get("counter").expect("counter should be registered");
        let (handle, _task) = spawn_actor(
            component.as_ref(),
            identity(),
            StateStore::default(),
            ActorConfig {
                idle_timeout,
                mailbox_capacity: 8,
            },
        )
        .await;
        handle
    }

    fn ctx(command: &str) -> CommandContext {
        CommandContext::new("counter", command).with_entity_id("c-1")
    }

    async fn current_value(handle: &EntityHandle) -> serde_json::Value {
        let handled = handle
            .execute(ctx("GetCurrentCounter"), json!({}))
            .await
            .expect("delivery should succeed")
            .expect("read should succeed");
        handled.outcome.reply().cloned().expect("read should reply")
    }

    #[tokio::test]
    async fn execute_increase_three_times() {
        let handle = spawn_counter(NEVER).await;
        for _ in 0..3 {
            handle
                .execute(ctx("Increase"), json!({"value": 1}))
                .await
                .expect("delivery should succeed")
                .expect("increase should succeed");
        }
        assert_eq!(current_value(&handle).await, json!({"value": 3}));
    }

    #[tokio::test]
    async fn router_error_is_returned_to_caller() {
        let handle = spawn_counter(NEVER).await;
        let result = handle
            .execute(ctx("Reset"), json!({}))
            .await
            .expect("delivery should succeed");
        assert!(matches!(result, Err(RouterError::HandlerNotFound { .. })));
        assert!(handle.is_alive(), "a routing error must not stop the actor");
    }

    #[tokio::test]
    async fn concurrent_callers_are_serialized() {
        let handle = spawn_counter(NEVER).await;
        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    handle
                        .execute(ctx("Increase"), json!({"value": 1}))
                        .await
                        .expect("delivery should succeed")
                        .expect("increase should succeed");
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("task should not panic");
        }
        assert_eq!(current_value(&handle).await, json!({"value": 10}));
    }

    #[tokio::test]
    async fn idle_timeout_shuts_down_actor() {
        let handle = spawn_counter(Duration::from_millis(200)).await;
        handle
            .execute(ctx("Increase"), json!({"value": 1}))
            .await
            .expect("delivery should succeed")
            .expect("increase should succeed");

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(!handle.is_alive(), "actor should be dead after idle timeout");
        let result = handle.execute(ctx("GetCurrentCounter"), json!({})).await;
        assert!(
            matches!(result, Err(DeliveryError::Undelivered { ref ctx, .. }) if ctx.command_name == "GetCurrentCounter"),
            "command to a passivated actor should be handed back"
        );
    }

    #[tokio::test]
    async fn rapid_commands_prevent_idle_eviction() {
        let handle = spawn_counter(Duration::from_millis(300)).await;
        for _ in 0..5 {
            handle
                .execute(ctx("Increase"), json!({"value": 1}))
                .await
                .expect("delivery should succeed")
                .expect("increase should succeed");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(handle.is_alive(), "actor should still be alive during activity");
        assert_eq!(current_value(&handle).await, json!({"value": 5}));
    }

    #[tokio::test]
    async fn shutdown_processes_queued_commands_first() {
        let handle = spawn_counter(NEVER).await;
        let queued = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .execute(ctx("Increase"), json!({"value": 4}))
                    .await
            })
        };
        tokio::task::yield_now().await;
        handle.shutdown().await;

        let handled = queued
            .await
            .expect("task should not panic")
            .expect("queued command should be delivered")
            .expect("increase should succeed");
        assert!(handled.committed());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn state_persists_across_respawn() {
        let registry = counter_registry();
        let component: Arc<dyn ErasedComponent> =
            Arc::clone(registry.get("counter").expect("counter should be registered"));
        let store = StateStore::default();
        let config = ActorConfig {
            idle_timeout: NEVER,
            mailbox_capacity: 4,
        };

        // First actor: increase, then shut down and wait for it to exit.
        let (first, task) =
            spawn_actor(component.as_ref(), identity(), Arc::clone(&store), config).await;
        first
            .execute(ctx("Increase"), json!({"value": 9}))
            .await
            .expect("delivery should succeed")
            .expect("increase should succeed");
        first.shutdown().await;
        task.await.expect("actor task should not panic");

        // Second actor for the same identity resumes from the stored state.
        let (second, _task) = spawn_actor(component.as_ref(), identity(), store, config).await;
        assert_eq!(current_value(&second).await, json!({"value": 9}));
    }

    #[tokio::test]
    async fn deletion_clears_stored_state() {
        let registry = counter_registry();
        let component = registry.get("counter").expect("counter should be registered");
        let store = StateStore::default();
        let config = ActorConfig {
            idle_timeout: NEVER,
            mailbox_capacity: 4,
        };
        let (handle, _task) =
            spawn_actor(component.as_ref(), identity(), Arc::clone(&store), config).await;

        handle
            .execute(ctx("Increase"), json!({"value": 2}))
            .await
            .expect("delivery should succeed")
            .expect("increase should succeed");
        assert_eq!(store.lock().await.len(), 1);

        handle
            .execute(ctx("Delete"), json!({}))
            .await
            .expect("delivery should succeed")
            .expect("delete should succeed");
        assert!(store.lock().await.is_empty());
    }
}
