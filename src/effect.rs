//! Effects: declarative descriptions of a command's outcome.
//!
//! A handler never performs I/O or mutates state directly. It returns an
//! [`Effect`] which the runtime interprets afterwards: commit a staged
//! update, send a reply, forward to another component, await a future, or
//! reject the command.
//!
//! Staged updates go through [`OnSuccess`], which is not itself an effect.
//! Only one of its `then_*` continuations turns it into one, so an update
//! without a reply, forward, or explicit no-reply cannot be returned from a
//! handler.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::command::{DeferredCall, Empty, Metadata, SideEffect};
use crate::error::{AsyncFailure, Rejection};
use crate::status::ErrorCode;

/// Event type for component kinds that never emit events.
///
/// Uninhabited: no value of this type exists, so `emit_event` cannot be
/// called for such components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoEvents {}

/// Terminal outcome of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// Send `value` to the caller.
    Reply { value: T, metadata: Metadata },
    /// Reject the command.
    Error(Rejection),
    /// Let another component produce the reply.
    Forward(DeferredCall),
    /// Complete without a reply.
    NoReply,
}

impl<T> Outcome<T> {
    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }

    pub fn reply(&self) -> Option<&T> {
        match self {
            Outcome::Reply { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Error(r) => Some(r),
            _ => None,
        }
    }

    pub fn forward(&self) -> Option<&DeferredCall> {
        match self {
            Outcome::Forward(call) => Some(call),
            _ => None,
        }
    }

    /// Transform the reply value, leaving every other variant unchanged.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Reply { value, metadata } => Outcome::Reply {
                value: f(value),
                metadata,
            },
            Outcome::Error(r) => Outcome::Error(r),
            Outcome::Forward(call) => Outcome::Forward(call),
            Outcome::NoReply => Outcome::NoReply,
        }
    }
}

/// Update staged by a stateful handler.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange<S, Ev> {
    /// Replace the whole state (value and replicated entities).
    Replace(S),
    /// Append events (event sourced entities), optionally deleting the
    /// entity once they are applied.
    Emit { events: Vec<Ev>, delete: bool },
    /// Delete the entity.
    Delete,
}

impl<S, Ev> StateChange<S, Ev> {
    /// Short name used in diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            StateChange::Replace(_) => "state update",
            StateChange::Emit { .. } => "event emission",
            StateChange::Delete => "entity deletion",
        }
    }
}

type Continuation<T, S> = Box<dyn FnOnce(&S) -> Outcome<T> + Send>;
type SideEffectFn<S> = Box<dyn FnOnce(&S) -> SideEffect + Send>;

/// Future behind an async effect.
pub type EffectFuture<T, S, Ev> = BoxFuture<'static, Result<Effect<T, S, Ev>, AsyncFailure>>;

pub(crate) enum Primary<T, S, Ev> {
    Outcome(Outcome<T>),
    Update {
        change: StateChange<S, Ev>,
        then: Continuation<T, S>,
        side_effects: Vec<SideEffectFn<S>>,
    },
    Async(EffectFuture<T, S, Ev>),
}

/// The result of a command handler.
///
/// # Type Parameters
///
/// * `T` - Reply type of the command.
/// * `S` - State type of the component (`()` for actions).
/// * `Ev` - Event type of the component ([`NoEvents`] unless event sourced).
///
/// An effect is move-only and consumed exactly once by the runtime.
///
/// # Examples
///
/// ```
/// use entity_router::{Effect, Empty};
///
/// #[derive(Clone)]
/// struct CounterState {
///     value: i64,
/// }
///
/// fn increase(state: &CounterState, by: i64) -> Effect<Empty, CounterState> {
///     if by < 0 {
///         return Effect::error("increase value must be a positive number");
///     }
///     Effect::update_state(CounterState { value: state.value + by }).then_reply(Empty {})
/// }
///
/// assert!(increase(&CounterState { value: 0 }, -1).is_error());
/// assert!(increase(&CounterState { value: 0 }, 1).state_change().is_some());
/// ```
#[must_use = "an effect does nothing unless returned to the runtime"]
pub struct Effect<T, S = (), Ev = NoEvents> {
    pub(crate) primary: Primary<T, S, Ev>,
    pub(crate) side_effects: Vec<SideEffect>,
}

impl<T, S, Ev> Effect<T, S, Ev> {
    fn from_outcome(outcome: Outcome<T>) -> Self {
        Self {
            primary: Primary::Outcome(outcome),
            side_effects: Vec::new(),
        }
    }

    /// Reply with `value`.
    pub fn reply(value: T) -> Self {
        Self::reply_with_metadata(value, Metadata::default())
    }

    /// Reply with `value` and attach `metadata` to the reply.
    pub fn reply_with_metadata(value: T, metadata: Metadata) -> Self {
        Self::from_outcome(Outcome::Reply { value, metadata })
    }

    /// Reject the command with [`ErrorCode::InvalidArgument`].
    pub fn error(description: impl Into<String>) -> Self {
        Self::from_outcome(Outcome::Error(Rejection::new(description)))
    }

    /// Reject the command with an explicit status code.
    pub fn error_with_code(description: impl Into<String>, code: ErrorCode) -> Self {
        Self::from_outcome(Outcome::Error(Rejection::with_code(description, code)))
    }

    /// Let `call` produce the reply to this command.
    pub fn forward(call: DeferredCall) -> Self {
        Self::from_outcome(Outcome::Forward(call))
    }

    /// Complete without replying to the caller.
    pub fn no_reply() -> Self {
        Self::from_outcome(Outcome::NoReply)
    }

    /// Attach a side effect, performed after a successful commit.
    ///
    /// Side effects attached to an error effect are discarded.
    pub fn add_side_effect(self, side_effect: SideEffect) -> Self {
        self.add_side_effects([side_effect])
    }

    /// Attach several side effects, kept in iteration order.
    ///
    /// Like [`add_side_effect`](Self::add_side_effect), a no-op on an error
    /// effect.
    pub fn add_side_effects(mut self, side_effects: impl IntoIterator<Item = SideEffect>) -> Self {
        if !self.is_error() {
            self.side_effects.extend(side_effects);
        }
        self
    }

    /// Whether this effect rejects the command.
    pub fn is_error(&self) -> bool {
        matches!(&self.primary, Primary::Outcome(o) if o.is_error())
    }

    /// Whether the outcome depends on a future.
    pub fn is_async(&self) -> bool {
        matches!(self.primary, Primary::Async(_))
    }

    /// The staged update, if any.
    pub fn state_change(&self) -> Option<&StateChange<S, Ev>> {
        match &self.primary {
            Primary::Update { change, .. } => Some(change),
            _ => None,
        }
    }

    /// The terminal outcome, for effects without a staged update or future.
    pub fn outcome(&self) -> Option<&Outcome<T>> {
        match &self.primary {
            Primary::Outcome(o) => Some(o),
            _ => None,
        }
    }

    /// Side effects attached directly to this effect.
    pub fn side_effects(&self) -> &[SideEffect] {
        &self.side_effects
    }
}

impl<T, S, Ev> Effect<T, S, Ev>
where
    T: Send + 'static,
    S: Send + 'static,
    Ev: Send + 'static,
{
    /// Defer the decision to `future`.
    ///
    /// The runtime awaits the future and treats the effect it produces as if
    /// it had been returned directly. A failed future rejects the command.
    pub fn async_effect<F>(future: F) -> Self
    where
        F: Future<Output = Result<Effect<T, S, Ev>, AsyncFailure>> + Send + 'static,
    {
        Self {
            primary: Primary::Async(Box::pin(future)),
            side_effects: Vec::new(),
        }
    }

    /// Reply with the value `future` resolves to.
    pub fn async_reply<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, AsyncFailure>> + Send + 'static,
    {
        Self::async_effect(async move { future.await.map(Effect::reply) })
    }

    /// Rewrite every outcome this effect can produce, including those
    /// computed later by continuations and futures.
    pub(crate) fn map_outcome<U>(
        self,
        f: Arc<dyn Fn(Outcome<T>) -> Outcome<U> + Send + Sync>,
    ) -> Effect<U, S, Ev>
    where
        U: Send + 'static,
    {
        let primary = match self.primary {
            Primary::Outcome(o) => Primary::Outcome(f(o)),
            Primary::Update {
                change,
                then,
                side_effects,
            } => Primary::Update {
                change,
                then: Box::new(move |state: &S| f(then(state))),
                side_effects,
            },
            Primary::Async(future) => Primary::Async(Box::pin(async move {
                future.await.map(|effect| effect.map_outcome(f))
            })),
        };
        Effect {
            primary,
            side_effects: self.side_effects,
        }
    }
}

impl<S, Ev> Effect<Empty, S, Ev> {
    /// Stage a full state replacement.
    ///
    /// For replicated entities this is a copy-on-write update: the handler
    /// builds a new value from the current one and hands it over whole.
    pub fn update_state(new_state: S) -> OnSuccess<S, Ev> {
        OnSuccess::new(StateChange::Replace(new_state))
    }

    /// Stage deletion of the entity.
    pub fn delete_entity() -> OnSuccess<S, Ev> {
        OnSuccess::new(StateChange::Delete)
    }

    /// Stage a single event.
    pub fn emit_event(event: Ev) -> OnSuccess<S, Ev> {
        Self::emit_events([event])
    }

    /// Stage events, applied in order.
    pub fn emit_events(events: impl IntoIterator<Item = Ev>) -> OnSuccess<S, Ev> {
        OnSuccess::new(StateChange::Emit {
            events: events.into_iter().collect(),
            delete: false,
        })
    }
}

/// A staged update awaiting its continuation.
///
/// Continuations that take a closure receive the state as it will be after
/// the update commits.
#[must_use = "a staged update needs a then_* continuation to become an effect"]
pub struct OnSuccess<S, Ev> {
    change: StateChange<S, Ev>,
    side_effects: Vec<SideEffectFn<S>>,
}

impl<S, Ev> OnSuccess<S, Ev> {
    fn new(change: StateChange<S, Ev>) -> Self {
        Self {
            change,
            side_effects: Vec::new(),
        }
    }

    /// Delete the entity after the staged events are applied.
    ///
    /// On a state replacement this discards the replacement.
    pub fn delete_entity(mut self) -> Self {
        self.change = match self.change {
            StateChange::Emit { events, .. } => StateChange::Emit {
                events,
                delete: true,
            },
            _ => StateChange::Delete,
        };
        self
    }

    /// Add a side effect computed from the updated state.
    pub fn then_add_side_effect<F>(mut self, side_effect: F) -> Self
    where
        F: FnOnce(&S) -> SideEffect + Send + 'static,
    {
        self.side_effects.push(Box::new(side_effect));
        self
    }

    fn finish<T>(self, then: Continuation<T, S>) -> Effect<T, S, Ev> {
        Effect {
            primary: Primary::Update {
                change: self.change,
                then,
                side_effects: self.side_effects,
            },
            side_effects: Vec::new(),
        }
    }

    /// Reply with `value` once the update commits.
    pub fn then_reply<T>(self, value: T) -> Effect<T, S, Ev>
    where
        T: Send + 'static,
    {
        self.then_reply_with_metadata(value, Metadata::default())
    }

    /// Reply with `value` and reply `metadata` once the update commits.
    pub fn then_reply_with_metadata<T>(self, value: T, metadata: Metadata) -> Effect<T, S, Ev>
    where
        T: Send + 'static,
    {
        self.finish(Box::new(move |_: &S| Outcome::Reply { value, metadata }))
    }

    /// Reply with a value computed from the updated state.
    pub fn then_reply_with<T, F>(self, reply: F) -> Effect<T, S, Ev>
    where
        F: FnOnce(&S) -> T + Send + 'static,
    {
        self.finish(Box::new(move |state: &S| Outcome::Reply {
            value: reply(state),
            metadata: Metadata::default(),
        }))
    }

    /// Forward to `call` once the update commits.
    pub fn then_forward<T>(self, call: DeferredCall) -> Effect<T, S, Ev> {
        self.finish(Box::new(move |_: &S| Outcome::Forward(call)))
    }

    /// Forward to a call computed from the updated state.
    pub fn then_forward_with<T, F>(self, call: F) -> Effect<T, S, Ev>
    where
        F: FnOnce(&S) -> DeferredCall + Send + 'static,
    {
        self.finish(Box::new(move |state: &S| Outcome::Forward(call(state))))
    }

    /// Commit without replying.
    pub fn then_no_reply<T>(self) -> Effect<T, S, Ev> {
        self.finish(Box::new(|_: &S| Outcome::NoReply))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RowChange<S> {
    Update(S),
    Delete,
    Ignore,
    Error(Rejection),
}

/// The result of a view update handler.
///
/// A view reacts to a change in some source component and decides what
/// happens to its own row: replace it, delete it, leave it as it is, or
/// fail. Updates never reply, so there is no continuation to pick.
///
/// The runtime lowers an update effect into an ordinary [`Effect`] that
/// commits without replying, which keeps views on the same interpreter as
/// every other kind.
#[must_use = "an update effect does nothing unless returned to the runtime"]
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEffect<S> {
    change: RowChange<S>,
}

impl<S> UpdateEffect<S> {
    /// Replace the view row with `new_state`.
    pub fn update_state(new_state: S) -> Self {
        Self {
            change: RowChange::Update(new_state),
        }
    }

    /// Delete the view row.
    pub fn delete_state() -> Self {
        Self {
            change: RowChange::Delete,
        }
    }

    /// Leave the row untouched.
    pub fn ignore() -> Self {
        Self {
            change: RowChange::Ignore,
        }
    }

    /// Fail the update with [`ErrorCode::InvalidArgument`].
    pub fn error(description: impl Into<String>) -> Self {
        Self {
            change: RowChange::Error(Rejection::new(description)),
        }
    }

    pub fn error_with_code(description: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            change: RowChange::Error(Rejection::with_code(description, code)),
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self.change, RowChange::Ignore)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.change, RowChange::Error(_))
    }

    /// The replacement row, if this update stores one.
    pub fn new_state(&self) -> Option<&S> {
        match &self.change {
            RowChange::Update(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn into_effect<T, Ev>(self) -> Effect<T, S, Ev> {
        match self.change {
            RowChange::Update(state) => OnSuccess::new(StateChange::Replace(state)).then_no_reply(),
            RowChange::Delete => OnSuccess::new(StateChange::Delete).then_no_reply(),
            RowChange::Ignore => Effect::no_reply(),
            RowChange::Error(rejection) => Effect::from_outcome(Outcome::Error(rejection)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_effect_lowers_to_commit_without_reply() {
        let effect: Effect<(), i64> = UpdateEffect::update_state(3).into_effect();
        assert_eq!(effect.state_change(), Some(&StateChange::Replace(3)));

        let effect: Effect<(), i64> = UpdateEffect::delete_state().into_effect();
        assert_eq!(effect.state_change(), Some(&StateChange::Delete));
    }

    #[test]
    fn ignored_update_stages_nothing() {
        let update = UpdateEffect::<i64>::ignore();
        assert!(update.is_ignored());
        assert_eq!(update.new_state(), None);

        let effect: Effect<(), i64> = update.into_effect();
        assert!(effect.state_change().is_none());
        assert_eq!(effect.outcome(), Some(&Outcome::NoReply));
    }

    #[test]
    fn failed_update_keeps_its_code() {
        let update = UpdateEffect::<i64>::error_with_code("unknown city", ErrorCode::NotFound);
        assert!(update.is_error());

        let effect: Effect<(), i64> = update.into_effect();
        let rejection = effect.outcome().and_then(Outcome::rejection).cloned();
        assert_eq!(rejection.map(|r| r.code), Some(ErrorCode::NotFound));
    }

    type CounterEffect = Effect<Empty, i64>;

    #[test]
    fn reply_carries_value() {
        let effect: Effect<u32> = Effect::reply(7);
        assert_eq!(effect.outcome().and_then(Outcome::reply), Some(&7));
        assert!(effect.state_change().is_none());
    }

    #[test]
    fn reply_with_metadata_keeps_metadata() {
        let md = Metadata::default().with("etag", "v2");
        let effect: Effect<u32> = Effect::reply_with_metadata(1, md.clone());
        match effect.outcome() {
            Some(Outcome::Reply { metadata, .. }) => assert_eq!(metadata, &md),
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn error_has_default_code() {
        let effect: CounterEffect = Effect::error("nope");
        assert!(effect.is_error());
        let rejection = effect.outcome().and_then(Outcome::rejection).unwrap();
        assert_eq!(rejection.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn error_discards_side_effects() {
        let call = DeferredCall::new("audit", "Record", json!({}));
        let effect: CounterEffect = Effect::error("nope").add_side_effect(SideEffect::of(call));
        assert!(effect.side_effects().is_empty());
    }

    #[test]
    fn reply_accumulates_side_effects() {
        let a = SideEffect::of(DeferredCall::new("audit", "A", json!({})));
        let b = SideEffect::synchronous(DeferredCall::new("audit", "B", json!({})));
        let effect: Effect<Empty> = Effect::reply(Empty {})
            .add_side_effect(a.clone())
            .add_side_effects([b.clone()]);
        assert_eq!(effect.side_effects(), &[a, b]);
    }

    #[test]
    fn update_state_stages_replacement() {
        let effect: CounterEffect = Effect::update_state(10).then_reply(Empty {});
        assert_eq!(effect.state_change(), Some(&StateChange::Replace(10)));
        assert!(effect.outcome().is_none());
        assert!(!effect.is_error());
    }

    #[test]
    fn emit_then_delete_marks_deletion() {
        let effect: Effect<Empty, i64, &'static str> = Effect::emit_events(["opened", "closed"])
            .delete_entity()
            .then_no_reply();
        assert_eq!(
            effect.state_change(),
            Some(&StateChange::Emit {
                events: vec!["opened", "closed"],
                delete: true
            })
        );
    }

    #[test]
    fn delete_after_replace_becomes_delete() {
        let effect: CounterEffect = Effect::update_state(3).delete_entity().then_reply(Empty {});
        assert_eq!(effect.state_change(), Some(&StateChange::Delete));
    }

    #[test]
    fn async_effect_is_opaque_until_awaited() {
        let effect: Effect<u32> = Effect::async_reply(async { Ok(5) });
        assert!(effect.is_async());
        assert!(effect.outcome().is_none());
    }

    #[test]
    fn outcome_map_only_touches_reply() {
        let reply: Outcome<u32> = Outcome::Reply {
            value: 2,
            metadata: Metadata::default(),
        };
        assert_eq!(reply.map(|v| v * 10).reply(), Some(&20));

        let err: Outcome<u32> = Outcome::Error(Rejection::new("x"));
        assert!(err.map(|v| v * 10).is_error());
    }

    #[test]
    fn map_outcome_rewrites_immediate_reply() {
        let effect: Effect<u32> = Effect::reply(4);
        let mapped = effect.map_outcome(Arc::new(|o: Outcome<u32>| o.map(|v| v.to_string())));
        assert_eq!(
            mapped.outcome().and_then(Outcome::reply).map(String::as_str),
            Some("4")
        );
    }

    #[test]
    fn state_change_labels() {
        assert_eq!(StateChange::<i64, NoEvents>::Replace(1).label(), "state update");
        assert_eq!(StateChange::<i64, NoEvents>::Delete.label(), "entity deletion");
    }
}
