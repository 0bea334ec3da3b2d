//! In-memory reference runtime that interprets effects end to end.
//!
//! A [`Host`] is built with [`HostBuilder`] over a [`Registry`]. It keeps
//! one actor per entity identity (spawned on first use and passivated when
//! idle), runs actions directly on the caller's task, resolves forwards,
//! and performs side effects. State lives in memory only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::actor::{ActorConfig, DeliveryError, EntityHandle, EntityKey, StateStore, spawn_actor};
use crate::command::{CORRELATION_ID_KEY, CommandContext, DeferredCall, Metadata, SideEffect};
use crate::effect::Outcome;
use crate::error::CallError;
use crate::provider::EntityContext;
use crate::registry::{ErasedComponent, Handled, Registry};

/// Default idle timeout for entity actors: 5 minutes.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of commands an entity mailbox buffers.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Default limit on chained forwards and side effects.
pub const DEFAULT_MAX_FORWARD_DEPTH: usize = 16;

/// How many times a command is offered to a fresh actor after the previous
/// one passivated between lookup and send.
const MAX_DELIVERY_ATTEMPTS: usize = 3;

/// Host settings.
///
/// Deserializable so an application can load it from its own config,
/// with missing fields taking their defaults.
///
/// # Examples
///
/// ```
/// use entity_router::HostConfig;
///
/// let config: HostConfig = serde_json::from_str(r#"{ "mailbox_capacity": 8 }"#).unwrap();
/// assert_eq!(config.mailbox_capacity, 8);
/// assert_eq!(config.max_forward_depth, 16);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// How long an entity actor waits for a command before passivating.
    pub idle_timeout: Duration,
    pub mailbox_capacity: usize,
    /// Longest chain of forwards and side effects a single call may start.
    pub max_forward_depth: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            max_forward_depth: DEFAULT_MAX_FORWARD_DEPTH,
        }
    }
}

/// Reply to a [`Host::call`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// `None` when the command completed without a reply.
    pub value: Option<Value>,
    pub metadata: Metadata,
}

impl Response {
    /// Decode the reply value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.value.clone().map(serde_json::from_value).transpose()
    }
}

struct CachedActor {
    handle: EntityHandle,
    task: JoinHandle<()>,
}

/// The actor currently serving one identity, if any.
///
/// Spawning, respawning and passivation of an identity all happen with its
/// slot locked, so at most one actor per identity is ever running. The
/// cache map itself is only locked long enough to find or insert a slot.
type ActorSlot = Arc<Mutex<Option<CachedActor>>>;

type HandleCache = HashMap<EntityKey, ActorSlot>;

/// Runtime that routes calls to registered components.
///
/// `Clone` is cheap: all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct Host {
    registry: Registry,
    config: HostConfig,
    cache: Arc<RwLock<HandleCache>>,
    states: StateStore,
}

// Manual `Debug`: the caches are not `Debug` and are internal anyway.
impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Host {
    pub fn builder(registry: Registry) -> HostBuilder {
        HostBuilder::new(registry)
    }

    /// A host with the default configuration.
    pub fn new(registry: Registry) -> Self {
        HostBuilder::new(registry).build()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Run `call` and everything it leads to.
    ///
    /// Entity commands are serialized per identity. Forwards are followed
    /// until a component replies. Synchronous side effects complete before
    /// this returns; asynchronous ones are spawned. A failing side effect
    /// is logged and does not change the result of the call.
    ///
    /// A call without an `x-correlation-id` metadata entry gets a fresh
    /// one, which every forward and side effect it causes inherits.
    ///
    /// # Errors
    ///
    /// - [`CallError::UnknownComponent`] if no provider has the identifier.
    /// - [`CallError::MissingEntityId`] if an entity is addressed without
    ///   an entity identity.
    /// - [`CallError::Rejected`] if the handler (or its async future)
    ///   rejected the command.
    /// - [`CallError::Router`] for routing and programming errors.
    /// - [`CallError::ForwardDepthExceeded`] on too long a forward chain.
    /// - [`CallError::ActorGone`] if the entity actor stopped unexpectedly.
    ///
    /// # Arguments
    ///
    /// * `call` - Target component, optional entity id, command name,
    ///   JSON payload and request metadata.
    ///
    /// # Returns
    ///
    /// The reply of whichever component produced it at the end of the
    /// forward chain, or an empty [`Response`] for a no-reply outcome.
    pub async fn call(&self, call: DeferredCall) -> Result<Response, CallError> {
        self.call_at_depth(call, 0).await
    }

    fn call_at_depth(&self, call: DeferredCall, depth: usize) -> BoxFuture<'_, Result<Response, CallError>> {
        Box::pin(async move {
            let component = Arc::clone(
                self.registry
                    .get(&call.component_id)
                    .ok_or_else(|| CallError::UnknownComponent(call.component_id.clone()))?,
            );

            let mut metadata = call.metadata;
            let correlation_id = match metadata.get(CORRELATION_ID_KEY) {
                Some(id) => id.to_owned(),
                None => {
                    let id = Uuid::new_v4().to_string();
                    metadata.set(CORRELATION_ID_KEY, id.clone());
                    id
                }
            };

            let mut ctx = CommandContext::new(component.component_id(), call.command)
                .with_metadata(metadata)
                .with_correlation_id(correlation_id.clone());

            let handled = if component.kind().has_identity() {
                let entity_id = call.entity_id.ok_or_else(|| CallError::MissingEntityId {
                    component_id: component.component_id().to_owned(),
                })?;
                ctx.entity_id = Some(entity_id.clone());
                self.execute_on_entity(&component, &entity_id, ctx.clone(), call.payload)
                    .await?
            } else {
                self.execute_action(component.as_ref(), ctx.clone(), call.payload)
                    .await?
            };

            self.perform_side_effects(handled.side_effects, depth).await;

            match handled.outcome {
                Outcome::Reply { value, metadata } => Ok(Response {
                    value: Some(value),
                    metadata,
                }),
                Outcome::NoReply => Ok(Response {
                    value: None,
                    metadata: Metadata::default(),
                }),
                Outcome::Error(rejection) => Err(CallError::Rejected(rejection)),
                Outcome::Forward(mut next) => {
                    let max = self.config.max_forward_depth;
                    if depth >= max {
                        return Err(CallError::ForwardDepthExceeded { depth: max });
                    }
                    let carried = ctx.metadata.select(&component.options().forward_metadata);
                    next.metadata.merge_missing(&carried);
                    if next.metadata.get(CORRELATION_ID_KEY).is_none() {
                        next.metadata.set(CORRELATION_ID_KEY, correlation_id);
                    }
                    tracing::debug!(
                        from = component.component_id(),
                        to = %next.component_id,
                        command = %next.command,
                        "forwarding"
                    );
                    self.call_at_depth(next, depth + 1).await
                }
            }
        })
    }

    async fn execute_action(
        &self,
        component: &dyn ErasedComponent,
        ctx: CommandContext,
        payload: Value,
    ) -> Result<Handled, CallError> {
        let span = tracing::info_span!(
            "command",
            component_id = component.component_id(),
            command = %ctx.command_name,
        );
        let mut instance = component.spawn_instance(
            EntityContext {
                component_id: component.component_id().to_owned(),
                entity_id: None,
            },
            None,
        );
        Ok(instance.handle(ctx, payload).instrument(span).await?)
    }

    async fn execute_on_entity(
        &self,
        component: &Arc<dyn ErasedComponent>,
        entity_id: &str,
        ctx: CommandContext,
        payload: Value,
    ) -> Result<Handled, CallError> {
        let mut ctx = ctx;
        let mut payload = payload;
        for _ in 0..MAX_DELIVERY_ATTEMPTS {
            let handle = self.handle_for(component, entity_id).await;
            match handle.execute(ctx, payload).await {
                Ok(result) => return Ok(result?),
                Err(DeliveryError::Undelivered {
                    ctx: returned_ctx,
                    payload: returned_payload,
                }) => {
                    ctx = returned_ctx;
                    payload = returned_payload;
                }
                Err(DeliveryError::Lost) => return Err(CallError::ActorGone),
            }
        }
        Err(CallError::ActorGone)
    }

    /// The slot for `key`, created empty on first use.
    async fn slot_for(&self, key: &EntityKey) -> ActorSlot {
        // Fast path: check cache with read lock.
        if let Some(slot) = self.cache.read().await.get(key) {
            return Arc::clone(slot);
        }
        let mut cache = self.cache.write().await;
        Arc::clone(cache.entry(key.clone()).or_default())
    }

    /// Get a handle to the actor for an identity, spawning it if needed.
    async fn handle_for(&self, component: &Arc<dyn ErasedComponent>, entity_id: &str) -> EntityHandle {
        let key = (component.component_id().to_owned(), entity_id.to_owned());
        let slot = self.slot_for(&key).await;
        let mut slot = slot.lock().await;

        if let Some(cached) = slot.as_ref()
            && cached.handle.is_alive()
        {
            return cached.handle.clone();
        }

        // A passivated actor may still be finishing its queue. Wait for it
        // so an identity never has two live instances.
        if let Some(stale) = slot.take()
            && let Err(e) = stale.task.await
        {
            tracing::error!(
                component_id = component.component_id(),
                entity_id,
                error = %e,
                "entity actor failed"
            );
        }

        tracing::debug!(
            component_id = component.component_id(),
            entity_id,
            "spawning actor"
        );

        let config = ActorConfig {
            idle_timeout: component
                .options()
                .idle_timeout
                .unwrap_or(self.config.idle_timeout),
            mailbox_capacity: self.config.mailbox_capacity,
        };
        let identity = EntityContext {
            component_id: key.0.clone(),
            entity_id: Some(key.1.clone()),
        };
        let (handle, task) =
            spawn_actor(component.as_ref(), identity, Arc::clone(&self.states), config).await;
        *slot = Some(CachedActor {
            handle: handle.clone(),
            task,
        });
        handle
    }

    async fn perform_side_effects(&self, side_effects: Vec<SideEffect>, depth: usize) {
        for side_effect in side_effects {
            let SideEffect { call, synchronous } = side_effect;
            if depth >= self.config.max_forward_depth {
                tracing::error!(
                    component_id = %call.component_id,
                    command = %call.command,
                    "side effect dropped: call chain too deep"
                );
                continue;
            }
            if synchronous {
                if let Err(e) = self.call_at_depth(call, depth + 1).await {
                    tracing::error!(error = %e, "synchronous side effect failed");
                }
            } else {
                let host = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = host.call_at_depth(call, depth + 1).await {
                        tracing::warn!(error = %e, "side effect failed");
                    }
                });
            }
        }
    }

    /// Stop the actor for an identity after its queued commands.
    ///
    /// The entity's state is retained; the next call spawns a fresh actor
    /// that resumes from it. Calls arriving while the actor drains wait
    /// for it to finish, then go to the fresh actor.
    ///
    /// # Returns
    ///
    /// `true` if an actor was running for the identity, `false` otherwise.
    pub async fn passivate(&self, component_id: &str, entity_id: &str) -> bool {
        let key = (component_id.to_owned(), entity_id.to_owned());
        let Some(slot) = self.cache.read().await.get(&key).map(Arc::clone) else {
            return false;
        };
        let mut slot = slot.lock().await;
        let Some(cached) = slot.take() else {
            return false;
        };
        let alive = cached.handle.is_alive();
        cached.handle.shutdown().await;
        if let Err(e) = cached.task.await {
            tracing::error!(component_id, entity_id, error = %e, "entity actor failed");
        }
        alive
    }

    /// Number of entity actors currently accepting commands.
    pub async fn active_entities(&self) -> usize {
        let slots: Vec<ActorSlot> = self.cache.read().await.values().map(Arc::clone).collect();
        let mut active = 0;
        for slot in slots {
            if slot
                .lock()
                .await
                .as_ref()
                .is_some_and(|cached| cached.handle.is_alive())
            {
                active += 1;
            }
        }
        active
    }
}

/// Builder for configuring a [`Host`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use entity_router::{Host, Registry};
///
/// let host = Host::builder(Registry::new())
///     .idle_timeout(Duration::from_secs(60))
///     .mailbox_capacity(64)
///     .build();
/// assert_eq!(host.config().mailbox_capacity, 64);
/// ```
#[derive(Debug)]
pub struct HostBuilder {
    registry: Registry,
    config: HostConfig,
}

impl HostBuilder {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            config: HostConfig::default(),
        }
    }

    /// Set the idle timeout after which entity actors passivate.
    ///
    /// Components can override it with
    /// [`ComponentOptions::idle_timeout`](crate::ComponentOptions).
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set how many commands an entity mailbox buffers before senders wait.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.config.mailbox_capacity = capacity;
        self
    }

    /// Set the longest chain of forwards and side effects one call may start.
    pub fn max_forward_depth(mut self, depth: usize) -> Self {
        self.config.max_forward_depth = depth;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Host {
        Host {
            registry: self.registry,
            config: self.config,
            cache: Arc::new(RwLock::new(HashMap::new())),
            states: StateStore::default(),
        }
    }
}
