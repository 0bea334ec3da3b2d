//! Component trait and component kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::router::RouterBuilder;

/// The kind of a component, which decides the updates it may stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Stateless request handler without identity.
    Action,
    /// Entity whose state is replaced wholesale by each update.
    ValueEntity,
    /// Entity whose state is derived by folding its events.
    EventSourcedEntity,
    /// Entity holding replicated data, updated copy-on-write.
    ReplicatedEntity,
    /// Read model whose rows are maintained by update handlers reacting to
    /// changes in other components. Each row is addressed by an identity.
    View,
}

impl ComponentKind {
    /// Whether instances are addressed by an entity identity.
    pub fn has_identity(self) -> bool {
        !matches!(self, ComponentKind::Action)
    }

    pub(crate) fn allows_replace(self) -> bool {
        matches!(
            self,
            ComponentKind::ValueEntity | ComponentKind::ReplicatedEntity | ComponentKind::View
        )
    }

    pub(crate) fn allows_events(self) -> bool {
        matches!(self, ComponentKind::EventSourcedEntity)
    }

    pub(crate) fn allows_delete(self) -> bool {
        self.has_identity()
    }

    /// Whether update handlers may be registered.
    pub fn allows_updates(self) -> bool {
        matches!(self, ComponentKind::View)
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentKind::Action => "action",
            ComponentKind::ValueEntity => "value entity",
            ComponentKind::EventSourcedEntity => "event sourced entity",
            ComponentKind::ReplicatedEntity => "replicated entity",
            ComponentKind::View => "view",
        };
        f.write_str(name)
    }
}

/// A component whose commands are routed to typed handlers.
///
/// The implementing type is the component instance created by a
/// [`Provider`](crate::Provider) factory. Its state is a separate value
/// owned by the runtime and handed to each handler by reference.
///
/// # Associated Types
///
/// - `State`: the state handlers read (`()` for actions).
/// - `Event`: events an event sourced entity emits
///   ([`NoEvents`](crate::NoEvents) for every other kind).
///
/// # Contract
///
/// - Handlers must be pure decision functions: no I/O, no interior
///   mutation. Everything that should happen is described by the returned
///   [`Effect`](crate::Effect).
/// - [`routes`](Component::routes) is called once per component type to
///   build its dispatch table.
pub trait Component: Send + Sync + Sized + 'static {
    /// Identifies this component (e.g. "counter"). Must be unique within a
    /// [`Registry`](crate::Registry).
    const COMPONENT_ID: &'static str;

    const KIND: ComponentKind;

    type State: Clone + Send + Sync + 'static;

    type Event: Clone + Send + Sync + 'static;

    /// State of an entity that has not handled any command yet, or that
    /// was deleted.
    fn empty_state(&self) -> Self::State;

    /// Register command handlers (plus the event handler for event sourced
    /// entities, or update handlers for views).
    fn routes(routes: RouterBuilder<Self>) -> RouterBuilder<Self>;
}
