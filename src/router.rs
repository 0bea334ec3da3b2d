//! Command router: dispatch table from command name to typed handler, and
//! the interpreter that turns a handler's effect into a committed update.
//!
//! A [`Router`] is built once per component type from
//! [`Component::routes`] and shared by every instance of that type. It
//! holds no state of its own and takes no locks: concurrency control is
//! the runtime's job.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::command::{CommandContext, SideEffect};
use crate::component::Component;
use crate::component::ComponentKind;
use crate::effect::{Effect, Outcome, Primary, StateChange, UpdateEffect};
use crate::error::{ProgrammingError, Rejection, RouterError};
use crate::status::ErrorCode;

/// Effect of a routed command, with the reply erased to JSON.
pub type RoutedEffect<C> = Effect<Value, <C as Component>::State, <C as Component>::Event>;

type CommandHandler<C> = Box<
    dyn Fn(&C, &<C as Component>::State, Value, &CommandContext) -> Result<RoutedEffect<C>, RouterError>
        + Send
        + Sync,
>;

type EventHandler<C> = Box<
    dyn Fn(&C, <C as Component>::State, &<C as Component>::Event) -> <C as Component>::State
        + Send
        + Sync,
>;

/// Collects handlers for a component type.
///
/// Obtained inside [`Component::routes`]. Registration errors are reported
/// by [`build`](RouterBuilder::build), not when a handler is added, so
/// `routes` can stay a plain chain of calls.
pub struct RouterBuilder<C: Component> {
    handlers: Vec<(&'static str, CommandHandler<C>)>,
    updates: Vec<(&'static str, CommandHandler<C>)>,
    event_handler: Option<EventHandler<C>>,
    event_handlers_registered: usize,
}

impl<C: Component> RouterBuilder<C> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            updates: Vec::new(),
            event_handler: None,
            event_handlers_registered: 0,
        }
    }

    /// Register a handler for `name`.
    ///
    /// The payload is decoded into `Cmd` before the handler runs and the
    /// reply `T` is encoded to JSON afterwards.
    pub fn command<Cmd, T, F>(self, name: &'static str, handler: F) -> Self
    where
        Cmd: DeserializeOwned,
        T: Serialize + Send + 'static,
        F: Fn(&C, &C::State, Cmd) -> Effect<T, C::State, C::Event> + Send + Sync + 'static,
    {
        self.command_with_context::<Cmd, T, _>(name, move |entity, state, cmd, _ctx| {
            handler(entity, state, cmd)
        })
    }

    /// Register a handler for `name` that also reads the [`CommandContext`].
    pub fn command_with_context<Cmd, T, F>(mut self, name: &'static str, handler: F) -> Self
    where
        Cmd: DeserializeOwned,
        T: Serialize + Send + 'static,
        F: Fn(&C, &C::State, Cmd, &CommandContext) -> Effect<T, C::State, C::Event>
            + Send
            + Sync
            + 'static,
    {
        let encode: Arc<dyn Fn(Outcome<T>) -> Outcome<Value> + Send + Sync> =
            Arc::new(encode_outcome::<T>);
        let erased: CommandHandler<C> = Box::new(move |entity, state, payload, ctx| {
            let cmd: Cmd =
                serde_json::from_value(payload).map_err(|source| RouterError::PayloadMismatch {
                    component: C::COMPONENT_ID.to_owned(),
                    command: name.to_owned(),
                    source,
                })?;
            Ok(handler(entity, state, cmd, ctx).map_outcome(Arc::clone(&encode)))
        });
        self.handlers.push((name, erased));
        self
    }

    /// Register a view update handler for `name`.
    ///
    /// The payload is the change the view reacts to (an event or a new
    /// state of the source component), decoded into `Change`. Only views
    /// accept update handlers; [`build`](RouterBuilder::build) rejects them
    /// on any other kind.
    pub fn update<Change, F>(self, name: &'static str, handler: F) -> Self
    where
        Change: DeserializeOwned,
        F: Fn(&C, &C::State, Change) -> UpdateEffect<C::State> + Send + Sync + 'static,
    {
        self.update_with_context::<Change, _>(name, move |view, row, change, _ctx| {
            handler(view, row, change)
        })
    }

    /// Register a view update handler that also reads the [`CommandContext`].
    pub fn update_with_context<Change, F>(mut self, name: &'static str, handler: F) -> Self
    where
        Change: DeserializeOwned,
        F: Fn(&C, &C::State, Change, &CommandContext) -> UpdateEffect<C::State>
            + Send
            + Sync
            + 'static,
    {
        let erased: CommandHandler<C> = Box::new(move |view, row, payload, ctx| {
            let change: Change =
                serde_json::from_value(payload).map_err(|source| RouterError::PayloadMismatch {
                    component: C::COMPONENT_ID.to_owned(),
                    command: name.to_owned(),
                    source,
                })?;
            Ok(handler(view, row, change, ctx).into_effect::<Value, C::Event>())
        });
        self.updates.push((name, erased));
        self
    }

    /// Register the event handler of an event sourced entity.
    ///
    /// The handler folds one event into the state. It must be total: every
    /// event the component emits has to be applicable.
    pub fn event<F>(mut self, handler: F) -> Self
    where
        F: Fn(&C, C::State, &C::Event) -> C::State + Send + Sync + 'static,
    {
        self.event_handler = Some(Box::new(handler));
        self.event_handlers_registered += 1;
        self
    }

    /// Validate the registrations and produce the router.
    ///
    /// # Errors
    ///
    /// Returns [`ProgrammingError`] when:
    ///
    /// - a command or update name is empty, or used twice (commands and
    ///   updates share one namespace);
    /// - an event sourced entity has no event handler, or another kind has one;
    /// - update handlers are registered on a component that is not a view.
    pub fn build(self) -> Result<Router<C>, ProgrammingError> {
        let component = C::COMPONENT_ID;
        if C::KIND.allows_events() {
            if self.event_handler.is_none() {
                return Err(ProgrammingError::MissingEventHandler {
                    component: component.to_owned(),
                });
            }
        } else if self.event_handlers_registered > 0 {
            return Err(ProgrammingError::UnexpectedEventHandler {
                component: component.to_owned(),
                kind: C::KIND,
            });
        }

        if !self.updates.is_empty() && !C::KIND.allows_updates() {
            return Err(ProgrammingError::UnexpectedUpdateHandler {
                component: component.to_owned(),
                kind: C::KIND,
            });
        }

        let mut seen = HashSet::with_capacity(self.handlers.len() + self.updates.len());
        for (name, _) in self.handlers.iter().chain(self.updates.iter()) {
            if name.is_empty() {
                return Err(ProgrammingError::EmptyCommandName {
                    component: component.to_owned(),
                });
            }
            if !seen.insert(*name) {
                return Err(ProgrammingError::DuplicateCommand {
                    component: component.to_owned(),
                    command: (*name).to_owned(),
                });
            }
        }

        Ok(Router {
            handlers: self.handlers.into_iter().collect(),
            updates: self.updates.into_iter().collect(),
            event_handler: self.event_handler,
        })
    }
}

impl<C: Component> Default for RouterBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_outcome<T: Serialize>(outcome: Outcome<T>) -> Outcome<Value> {
    match outcome {
        Outcome::Reply { value, metadata } => match serde_json::to_value(&value) {
            Ok(value) => Outcome::Reply { value, metadata },
            Err(e) => {
                tracing::error!(error = %e, "reply could not be encoded");
                Outcome::Error(Rejection::with_code(
                    format!("reply could not be encoded: {e}"),
                    ErrorCode::Internal,
                ))
            }
        },
        Outcome::Error(r) => Outcome::Error(r),
        Outcome::Forward(call) => Outcome::Forward(call),
        Outcome::NoReply => Outcome::NoReply,
    }
}

/// Dispatch table of one component type.
pub struct Router<C: Component> {
    handlers: HashMap<&'static str, CommandHandler<C>>,
    updates: HashMap<&'static str, CommandHandler<C>>,
    event_handler: Option<EventHandler<C>>,
}

impl<C: Component> Router<C> {
    /// Build the router declared by `C::routes`.
    pub fn of() -> Result<Self, ProgrammingError> {
        C::routes(RouterBuilder::new()).build()
    }

    /// Dispatch `command_name` to its handler.
    ///
    /// Matching is exact and case-sensitive. The handler only describes
    /// what should happen; nothing is applied until the effect is
    /// [`interpret`](Router::interpret)ed.
    ///
    /// # Arguments
    ///
    /// * `entity` - The component instance the handler is a method of.
    /// * `ctx` - Metadata and identity of the call.
    /// * `state` - Current state, read-only to the handler.
    /// * `command_name` - Registered name of the command.
    /// * `payload` - The command body, decoded into the handler's type.
    ///
    /// # Returns
    ///
    /// The handler's effect with its reply already encoded to JSON.
    ///
    /// # Errors
    ///
    /// - [`RouterError::HandlerNotFound`] if no handler has that name.
    /// - [`RouterError::PayloadMismatch`] if `payload` does not decode into
    ///   the handler's command type.
    pub fn handle_command(
        &self,
        entity: &C,
        ctx: &CommandContext,
        state: &C::State,
        command_name: &str,
        payload: Value,
    ) -> Result<RoutedEffect<C>, RouterError> {
        let handler = self
            .handlers
            .get(command_name)
            .ok_or_else(|| RouterError::HandlerNotFound {
                component: C::COMPONENT_ID.to_owned(),
                command: command_name.to_owned(),
            })?;
        handler(entity, state, payload, ctx)
    }

    /// Dispatch a change notification to the view update handler `update_name`.
    ///
    /// The returned effect commits the new row (or its deletion) and never
    /// replies. An ignored change yields an effect with nothing to commit.
    ///
    /// # Errors
    ///
    /// - [`RouterError::UpdateHandlerNotFound`] if no update handler has
    ///   that name.
    /// - [`RouterError::PayloadMismatch`] if `payload` does not decode into
    ///   the handler's change type.
    pub fn handle_update(
        &self,
        view: &C,
        ctx: &CommandContext,
        row: &C::State,
        update_name: &str,
        payload: Value,
    ) -> Result<RoutedEffect<C>, RouterError> {
        let handler = self
            .updates
            .get(update_name)
            .ok_or_else(|| RouterError::UpdateHandlerNotFound {
                component: C::COMPONENT_ID.to_owned(),
                update: update_name.to_owned(),
            })?;
        handler(view, row, payload, ctx)
    }

    /// Dispatch `name` to a command handler, or to an update handler when
    /// the component is a view and `name` is not one of its commands.
    ///
    /// This is the entry point runtimes use for every delivered message.
    pub fn route(
        &self,
        entity: &C,
        ctx: &CommandContext,
        state: &C::State,
        name: &str,
        payload: Value,
    ) -> Result<RoutedEffect<C>, RouterError> {
        if C::KIND == ComponentKind::View && !self.handlers.contains_key(name) {
            self.handle_update(entity, ctx, state, name, payload)
        } else {
            self.handle_command(entity, ctx, state, name, payload)
        }
    }

    /// Resolve `effect` against `state`.
    ///
    /// Async effects are awaited until a synchronous one remains. A staged
    /// update is checked against the component kind, events are folded
    /// through the event handler, and the continuation runs on the
    /// resulting state. A rejection at any step discards the update and
    /// every side effect.
    ///
    /// # Errors
    ///
    /// Returns [`ProgrammingError::UnsupportedUpdate`] (wrapped) if the
    /// update is not allowed for the component kind.
    pub async fn interpret(
        &self,
        entity: &C,
        state: &C::State,
        effect: RoutedEffect<C>,
    ) -> Result<Applied<C::State, C::Event>, RouterError> {
        let mut effect = effect;
        let mut side_effects: Vec<SideEffect> = Vec::new();
        loop {
            let Effect {
                primary,
                side_effects: attached,
            } = effect;
            match primary {
                Primary::Async(future) => {
                    side_effects.extend(attached);
                    match future.await {
                        Ok(next) => effect = next,
                        Err(failure) => {
                            tracing::warn!(
                                component_id = C::COMPONENT_ID,
                                error = %failure,
                                "async effect failed"
                            );
                            return Ok(Applied::rejected(failure.into_rejection()));
                        }
                    }
                }
                Primary::Outcome(Outcome::Error(rejection)) => {
                    return Ok(Applied::rejected(rejection));
                }
                Primary::Outcome(outcome) => {
                    side_effects.extend(attached);
                    return Ok(Applied {
                        committed: None,
                        outcome,
                        side_effects,
                    });
                }
                Primary::Update {
                    change,
                    then,
                    side_effects: deferred,
                } => {
                    self.check_supported(&change)?;
                    let (committed, new_state) = match change {
                        StateChange::Replace(next) => (Committed::State(next.clone()), next),
                        StateChange::Delete => (
                            Committed::Deleted { events: Vec::new() },
                            entity.empty_state(),
                        ),
                        StateChange::Emit { events, delete } => {
                            let next = self.fold_events(entity, state.clone(), &events)?;
                            if delete {
                                (Committed::Deleted { events }, next)
                            } else {
                                (
                                    Committed::Events {
                                        events,
                                        state: next.clone(),
                                    },
                                    next,
                                )
                            }
                        }
                    };
                    return match then(&new_state) {
                        Outcome::Error(rejection) => Ok(Applied::rejected(rejection)),
                        outcome => {
                            side_effects.extend(attached);
                            side_effects.extend(deferred.into_iter().map(|f| f(&new_state)));
                            Ok(Applied {
                                committed: Some(committed),
                                outcome,
                                side_effects,
                            })
                        }
                    };
                }
            }
        }
    }

    /// Fold `events` into `state` with the registered event handler.
    pub fn fold_events<'a>(
        &self,
        entity: &C,
        state: C::State,
        events: impl IntoIterator<Item = &'a C::Event>,
    ) -> Result<C::State, ProgrammingError> {
        let handler = self
            .event_handler
            .as_ref()
            .ok_or_else(|| ProgrammingError::MissingEventHandler {
                component: C::COMPONENT_ID.to_owned(),
            })?;
        Ok(events
            .into_iter()
            .fold(state, |state, event| handler(entity, state, event)))
    }

    fn check_supported(&self, change: &StateChange<C::State, C::Event>) -> Result<(), ProgrammingError> {
        let supported = match change {
            StateChange::Replace(_) => C::KIND.allows_replace(),
            StateChange::Emit { .. } => C::KIND.allows_events(),
            StateChange::Delete => C::KIND.allows_delete(),
        };
        if supported {
            Ok(())
        } else {
            Err(ProgrammingError::UnsupportedUpdate {
                component: C::COMPONENT_ID.to_owned(),
                kind: C::KIND,
                update: change.label(),
            })
        }
    }

    /// Registered command names, sorted.
    pub fn command_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Registered view update names, sorted. Empty for every other kind.
    pub fn update_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.updates.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Whether a command handler is registered under `command_name`.
    pub fn handles(&self, command_name: &str) -> bool {
        self.handlers.contains_key(command_name)
    }

    pub fn handles_update(&self, update_name: &str) -> bool {
        self.updates.contains_key(update_name)
    }
}

impl<C: Component> fmt::Debug for Router<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("component_id", &C::COMPONENT_ID)
            .field("kind", &C::KIND)
            .field("commands", &self.command_names())
            .field("updates", &self.update_names())
            .finish()
    }
}

/// Update that the runtime must persist after a successful command.
#[derive(Debug, Clone, PartialEq)]
pub enum Committed<S, Ev> {
    /// The state was replaced.
    State(S),
    /// Events were appended; `state` is the result of applying them.
    Events { events: Vec<Ev>, state: S },
    /// The entity was deleted, after appending `events` (if any).
    Deleted { events: Vec<Ev> },
}

/// Fully resolved result of a command.
#[derive(Debug)]
pub struct Applied<S, Ev> {
    /// Update to commit; always `None` when the outcome is an error.
    pub committed: Option<Committed<S, Ev>>,
    pub outcome: Outcome<Value>,
    /// Side effects to perform after the commit, in order.
    pub side_effects: Vec<SideEffect>,
}

impl<S, Ev> Applied<S, Ev> {
    fn rejected(rejection: Rejection) -> Self {
        Self {
            committed: None,
            outcome: Outcome::Error(rejection),
            side_effects: Vec::new(),
        }
    }

    pub fn reply(&self) -> Option<&Value> {
        self.outcome.reply()
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        self.outcome.rejection()
    }

    /// State after the commit, if the update carries one.
    ///
    /// Deletions return `None`; the runtime resets to the empty state.
    pub fn new_state(&self) -> Option<&S> {
        match &self.committed {
            Some(Committed::State(s)) | Some(Committed::Events { state: s, .. }) => Some(s),
            _ => None,
        }
    }

    /// Events appended by the commit.
    pub fn events(&self) -> &[Ev] {
        match &self.committed {
            Some(Committed::Events { events, .. }) | Some(Committed::Deleted { events }) => events,
            _ => &[],
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.committed, Some(Committed::Deleted { .. }))
    }
}
