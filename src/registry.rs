//! Registry of providers, keyed by component identifier.
//!
//! Providers are stored behind type-erased traits so a single map can hold
//! components of any type. Each concrete `TypedComponent<C>` owns the
//! provider and the shared router for `C`, and creates `TypedInstance<C>`
//! values that pair an instance with its state.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::command::{CommandContext, SideEffect};
use crate::component::{Component, ComponentKind};
use crate::effect::Outcome;
use crate::error::{RegistrationError, RouterError};
use crate::provider::{ComponentOptions, EntityContext, Provider};
use crate::router::{Committed, Router};

/// Type-erased view of a registered component.
pub(crate) trait ErasedComponent: Send + Sync {
    fn component_id(&self) -> &'static str;

    fn kind(&self) -> ComponentKind;

    fn options(&self) -> &ComponentOptions;

    fn command_names(&self) -> Vec<&'static str>;

    fn update_names(&self) -> Vec<&'static str>;

    /// Create an instance, resuming from `restored` when it holds a state
    /// of this component's type and from the empty state otherwise.
    fn spawn_instance(&self, ctx: EntityContext, restored: Option<ErasedState>) -> Box<dyn ErasedInstance>;
}

/// A component state with its type erased.
pub(crate) type ErasedState = Arc<dyn Any + Send + Sync>;

/// How a committed command changes the retained state of an entity.
#[derive(Clone)]
pub(crate) enum Persist {
    Save(ErasedState),
    Remove,
}

impl fmt::Debug for Persist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Persist::Save(_) => f.write_str("Save(..)"),
            Persist::Remove => f.write_str("Remove"),
        }
    }
}

/// A live instance together with the state it owns.
#[async_trait]
pub(crate) trait ErasedInstance: Send {
    /// Route and interpret one command, committing its update in place.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if routing fails or the effect is invalid
    /// for the component kind. State is left untouched in that case.
    async fn handle(&mut self, ctx: CommandContext, payload: Value) -> Result<Handled, RouterError>;
}

/// Result of a command as seen by the host.
#[derive(Debug)]
pub(crate) struct Handled {
    pub outcome: Outcome<Value>,
    pub side_effects: Vec<SideEffect>,
    /// Retained-state change; `None` when nothing was committed.
    pub commit: Option<Persist>,
}

#[cfg(test)]
impl Handled {
    pub fn committed(&self) -> bool {
        self.commit.is_some()
    }
}

struct TypedComponent<C: Component> {
    provider: Provider<C>,
    router: Arc<Router<C>>,
}

impl<C: Component> ErasedComponent for TypedComponent<C> {
    fn component_id(&self) -> &'static str {
        C::COMPONENT_ID
    }

    fn kind(&self) -> ComponentKind {
        C::KIND
    }

    fn options(&self) -> &ComponentOptions {
        self.provider.options()
    }

    fn command_names(&self) -> Vec<&'static str> {
        self.router.command_names()
    }

    fn update_names(&self) -> Vec<&'static str> {
        self.router.update_names()
    }

    fn spawn_instance(&self, ctx: EntityContext, restored: Option<ErasedState>) -> Box<dyn ErasedInstance> {
        let entity = self.provider.new_instance(&ctx);
        let state = restored
            .and_then(|s| s.downcast_ref::<C::State>().cloned())
            .unwrap_or_else(|| entity.empty_state());
        Box::new(TypedInstance {
            entity,
            state,
            router: Arc::clone(&self.router),
        })
    }
}

struct TypedInstance<C: Component> {
    entity: C,
    state: C::State,
    router: Arc<Router<C>>,
}

#[async_trait]
impl<C: Component> ErasedInstance for TypedInstance<C> {
    async fn handle(&mut self, ctx: CommandContext, payload: Value) -> Result<Handled, RouterError> {
        let effect =
            self.router
                .route(&self.entity, &ctx, &self.state, &ctx.command_name, payload)?;
        let applied = self.router.interpret(&self.entity, &self.state, effect).await?;

        let commit = match applied.committed {
            Some(Committed::State(state)) | Some(Committed::Events { state, .. }) => {
                self.state = state;
                Some(Persist::Save(Arc::new(self.state.clone())))
            }
            Some(Committed::Deleted { .. }) => {
                self.state = self.entity.empty_state();
                Some(Persist::Remove)
            }
            None => None,
        };

        Ok(Handled {
            outcome: applied.outcome,
            side_effects: applied.side_effects,
            commit,
        })
    }
}

/// A provider validated for registration.
///
/// Created from a [`Provider`] with `From`/`Into`. Validation happens on
/// conversion; its result is reported by [`Registry::with_components`].
pub struct Registration {
    component: Result<Arc<dyn ErasedComponent>, RegistrationError>,
}

impl<C: Component> From<Provider<C>> for Registration {
    fn from(provider: Provider<C>) -> Self {
        let component = if C::COMPONENT_ID.is_empty() {
            Err(RegistrationError::EmptyComponentId)
        } else {
            provider
                .router()
                .map(|router| {
                    Arc::new(TypedComponent {
                        provider,
                        router: Arc::new(router),
                    }) as Arc<dyn ErasedComponent>
                })
                .map_err(|source| RegistrationError::Malformed {
                    component_id: C::COMPONENT_ID.to_owned(),
                    source,
                })
        };
        Self { component }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.component {
            Ok(c) => f
                .debug_struct("Registration")
                .field("component_id", &c.component_id())
                .finish(),
            Err(e) => f.debug_struct("Registration").field("error", e).finish(),
        }
    }
}

/// Immutable set of registered components.
///
/// Registering returns a new registry and leaves the receiver as it was.
/// `Clone` is cheap: the table is shared behind an `Arc`.
///
/// # Examples
///
/// ```
/// use entity_router::Registry;
///
/// let registry = Registry::new();
/// assert!(registry.is_empty());
/// assert!(!registry.contains("counter"));
/// ```
#[derive(Clone, Default)]
pub struct Registry {
    components: Arc<HashMap<String, Arc<dyn ErasedComponent>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a registry that also contains `provider`.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::Duplicate`] if the identifier is taken.
    /// - [`RegistrationError::EmptyComponentId`] for an empty identifier.
    /// - [`RegistrationError::Malformed`] if the router does not build.
    pub fn register<C: Component>(&self, provider: Provider<C>) -> Result<Registry, RegistrationError> {
        self.with_components([Registration::from(provider)])
    }

    /// Return a registry containing every component in `registrations`.
    ///
    /// All or nothing: the first invalid or duplicate registration fails
    /// the whole batch. The receiver is never modified, so the same batch
    /// applied to the same registry always yields the same result.
    pub fn with_components(
        &self,
        registrations: impl IntoIterator<Item = Registration>,
    ) -> Result<Registry, RegistrationError> {
        let mut components = HashMap::clone(&self.components);
        for registration in registrations {
            let component = registration.component?;
            let id = component.component_id();
            if components.contains_key(id) {
                return Err(RegistrationError::Duplicate {
                    component_id: id.to_owned(),
                });
            }
            components.insert(id.to_owned(), component);
        }
        Ok(Registry {
            components: Arc::new(components),
        })
    }

    pub(crate) fn get(&self, component_id: &str) -> Option<&Arc<dyn ErasedComponent>> {
        self.components.get(component_id)
    }

    /// Whether a component is registered under `component_id`.
    pub fn contains(&self, component_id: &str) -> bool {
        self.components.contains_key(component_id)
    }

    /// Kind of a registered component, or `None` if it is unknown.
    pub fn kind_of(&self, component_id: &str) -> Option<ComponentKind> {
        self.get(component_id).map(|c| c.kind())
    }

    /// Command names of a registered component, sorted.
    pub fn command_names(&self, component_id: &str) -> Option<Vec<&'static str>> {
        self.get(component_id).map(|c| c.command_names())
    }

    /// Update handler names of a registered view, sorted. Empty for other
    /// kinds.
    pub fn update_names(&self, component_id: &str) -> Option<Vec<&'static str>> {
        self.get(component_id).map(|c| c.update_names())
    }

    /// Registered identifiers, sorted.
    pub fn component_ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.components.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("components", &self.component_ids())
            .finish()
    }
}
