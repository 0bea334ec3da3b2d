//! Single-entity harness for unit testing components.
//!
//! [`TestKit`] owns one instance and its state, runs commands through the
//! component's router one at a time, and keeps what was committed so tests
//! can assert on replies, state, events and side effects without a host.
//!
//! # Examples
//!
//! ```
//! use entity_router::{
//!     Component, ComponentKind, Effect, Empty, EntityContext, NoEvents, RouterBuilder, TestKit,
//! };
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Add {
//!     by: i64,
//! }
//!
//! struct Total;
//!
//! impl Component for Total {
//!     const COMPONENT_ID: &'static str = "total";
//!     const KIND: ComponentKind = ComponentKind::ValueEntity;
//!     type State = i64;
//!     type Event = NoEvents;
//!
//!     fn empty_state(&self) -> i64 {
//!         0
//!     }
//!
//!     fn routes(routes: RouterBuilder<Self>) -> RouterBuilder<Self> {
//!         routes.command("Add", |_: &Total, state: &i64, cmd: Add| {
//!             Effect::update_state(state + cmd.by).then_reply(Empty {})
//!         })
//!     }
//! }
//!
//! # tokio_test_block(async {
//! let mut kit = TestKit::of(|_: &EntityContext| Total).unwrap();
//! let result = kit.call("Add", &serde_json::json!({ "by": 2 })).await.unwrap();
//! assert!(result.state_was_updated());
//! assert_eq!(kit.state(), &2);
//! # });
//! # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::command::{CommandContext, DeferredCall, Metadata, SideEffect};
use crate::component::Component;
use crate::effect::Outcome;
use crate::error::{ProgrammingError, Rejection, RouterError};
use crate::provider::EntityContext;
use crate::router::{Applied, Committed, Router};

/// Entity identity used by [`TestKit::of`].
pub const DEFAULT_TEST_ENTITY_ID: &str = "testkit-entity-id";

/// Harness wrapping one component instance.
pub struct TestKit<C: Component> {
    entity: C,
    router: Router<C>,
    state: C::State,
    entity_id: Option<String>,
    events: Vec<C::Event>,
    deleted: bool,
}

impl<C: Component> TestKit<C> {
    /// Create an instance with [`DEFAULT_TEST_ENTITY_ID`].
    ///
    /// # Errors
    ///
    /// Returns [`ProgrammingError`] if the component's router does not
    /// build.
    pub fn of<F>(factory: F) -> Result<Self, ProgrammingError>
    where
        F: FnOnce(&EntityContext) -> C,
    {
        Self::with_entity_id(DEFAULT_TEST_ENTITY_ID, factory)
    }

    /// Create an instance for `entity_id`. Actions ignore the identity.
    pub fn with_entity_id<F>(entity_id: impl Into<String>, factory: F) -> Result<Self, ProgrammingError>
    where
        F: FnOnce(&EntityContext) -> C,
    {
        let router = Router::of()?;
        let entity_id = C::KIND.has_identity().then(|| entity_id.into());
        let entity = factory(&EntityContext {
            component_id: C::COMPONENT_ID.to_owned(),
            entity_id: entity_id.clone(),
        });
        let state = entity.empty_state();
        Ok(Self {
            entity,
            router,
            state,
            entity_id,
            events: Vec::new(),
            deleted: false,
        })
    }

    /// Start from `state` instead of the empty state.
    pub fn with_state(mut self, state: C::State) -> Self {
        self.state = state;
        self
    }

    /// Current state, after every command committed so far.
    pub fn state(&self) -> &C::State {
        &self.state
    }

    /// Every event committed so far, in order.
    pub fn all_events(&self) -> &[C::Event] {
        &self.events
    }

    /// Whether the last committed update deleted the entity.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Run `command` with `cmd` encoded as its payload.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if `cmd` cannot be encoded, the command is
    /// unknown, or the effect is invalid for the component kind. Handler
    /// rejections are not errors; they are reported by the result.
    pub async fn call<Cmd: Serialize>(
        &mut self,
        command: &str,
        cmd: &Cmd,
    ) -> Result<TestResult<C::State, C::Event>, RouterError> {
        self.call_with_metadata(command, cmd, Metadata::default()).await
    }

    /// Run `command` with request `metadata`, as a caller attaching headers
    /// would. A fresh correlation id is generated for every call.
    pub async fn call_with_metadata<Cmd: Serialize>(
        &mut self,
        command: &str,
        cmd: &Cmd,
        metadata: Metadata,
    ) -> Result<TestResult<C::State, C::Event>, RouterError> {
        let payload = serde_json::to_value(cmd).map_err(|source| RouterError::PayloadMismatch {
            component: C::COMPONENT_ID.to_owned(),
            command: command.to_owned(),
            source,
        })?;
        self.call_json(command, payload, metadata).await
    }

    /// Run `command` with an already encoded payload.
    ///
    /// For views, `command` may also name an update handler; the payload is
    /// then the change notification the view reacts to.
    pub async fn call_json(
        &mut self,
        command: &str,
        payload: Value,
        metadata: Metadata,
    ) -> Result<TestResult<C::State, C::Event>, RouterError> {
        let mut ctx = CommandContext::new(C::COMPONENT_ID, command)
            .with_metadata(metadata)
            .with_correlation_id(Uuid::new_v4().to_string());
        ctx.entity_id = self.entity_id.clone();

        let effect = self
            .router
            .route(&self.entity, &ctx, &self.state, command, payload)?;
        let applied = self.router.interpret(&self.entity, &self.state, effect).await?;

        match &applied.committed {
            Some(Committed::State(state)) => {
                self.state = state.clone();
                self.deleted = false;
            }
            Some(Committed::Events { events, state }) => {
                self.events.extend(events.iter().cloned());
                self.state = state.clone();
                self.deleted = false;
            }
            Some(Committed::Deleted { events }) => {
                self.events.extend(events.iter().cloned());
                self.state = self.entity.empty_state();
                self.deleted = true;
            }
            None => {}
        }

        Ok(TestResult { applied })
    }
}

/// Outcome of one [`TestKit`] command.
#[derive(Debug)]
pub struct TestResult<S, Ev> {
    applied: Applied<S, Ev>,
}

impl<S, Ev> TestResult<S, Ev> {
    /// Decode the reply.
    ///
    /// # Errors
    ///
    /// Fails if the command did not reply or the reply does not decode
    /// into `R`.
    pub fn reply<R: DeserializeOwned>(&self) -> Result<R, serde_json::Error> {
        let value = self.reply_value().ok_or_else(|| {
            <serde_json::Error as serde::de::Error>::custom("command produced no reply")
        })?;
        R::deserialize(value)
    }

    pub fn reply_value(&self) -> Option<&Value> {
        self.applied.reply()
    }

    pub fn reply_metadata(&self) -> Option<&Metadata> {
        match &self.applied.outcome {
            Outcome::Reply { metadata, .. } => Some(metadata),
            _ => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.reply_value().is_some()
    }

    pub fn is_error(&self) -> bool {
        self.applied.outcome.is_error()
    }

    pub fn is_no_reply(&self) -> bool {
        matches!(self.applied.outcome, Outcome::NoReply)
    }

    /// The rejection, if the handler or its future rejected the command.
    pub fn error(&self) -> Option<&Rejection> {
        self.applied.rejection()
    }

    pub fn forward(&self) -> Option<&DeferredCall> {
        self.applied.outcome.forward()
    }

    /// Whether the command committed an update.
    pub fn state_was_updated(&self) -> bool {
        self.applied.committed.is_some()
    }

    /// State after the command, for updates that carry one.
    pub fn updated_state(&self) -> Option<&S> {
        self.applied.new_state()
    }

    /// Events committed by this command.
    pub fn events(&self) -> &[Ev] {
        self.applied.events()
    }

    /// Side effects the host would perform, in order. Empty on rejection.
    pub fn side_effects(&self) -> &[SideEffect] {
        &self.applied.side_effects
    }

    pub fn was_deleted(&self) -> bool {
        self.applied.is_deleted()
    }

    pub fn into_applied(self) -> Applied<S, Ev> {
        self.applied
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::command::Empty;
    use crate::component::test_fixtures::*;
    use crate::status::ErrorCode;

    fn counter_kit() -> TestKit<Counter> {
        TestKit::of(|ctx: &EntityContext| Counter {
            entity_id: ctx.entity_id.clone(),
        })
        .expect("counter kit should build")
    }

    #[tokio::test]
    async fn increase_from_zero() {
        let mut kit = counter_kit();
        let result = kit
            .call("Increase", &IncreaseValue { value: 10 })
            .await
            .expect("call should succeed");

        assert_eq!(result.reply::<Empty>().expect("should reply"), Empty {});
        assert_eq!(result.updated_state(), Some(&CounterState { value: 10 }));
        assert_eq!(kit.state().value, 10);
    }

    #[tokio::test]
    async fn decrease_after_increase() {
        let mut kit = counter_kit();
        kit.call("Increase", &IncreaseValue { value: 10 })
            .await
            .expect("call should succeed");
        kit.call("Decrease", &DecreaseValue { value: 3 })
            .await
            .expect("call should succeed");
        assert_eq!(kit.state().value, 7);
    }

    #[tokio::test]
    async fn negative_increase_is_rejected_and_state_kept() {
        let mut kit = counter_kit().with_state(CounterState { value: 10 });
        let result = kit
            .call("Increase", &IncreaseValue { value: -5 })
            .await
            .expect("call should succeed");

        assert!(result.is_error());
        assert!(!result.state_was_updated());
        assert_eq!(
            result.error().map(|r| r.description.as_str()),
            Some("increase value must be a positive number")
        );
        assert_eq!(kit.state().value, 10);
    }

    #[tokio::test]
    async fn unknown_command_is_an_error() {
        let mut kit = counter_kit();
        let err = kit
            .call("Reset", &Empty {})
            .await
            .expect_err("unknown command should fail");
        assert!(matches!(err, RouterError::HandlerNotFound { .. }));
    }

    #[tokio::test]
    async fn entity_id_reaches_factory_and_context() {
        let mut kit = TestKit::with_entity_id("c-9", |ctx: &EntityContext| Counter {
            entity_id: ctx.entity_id.clone(),
        })
        .expect("counter kit should build");
        let result = kit.call("WhoAmI", &Empty {}).await.expect("call should succeed");
        assert_eq!(result.reply::<String>().expect("should reply"), "c-9:WhoAmI");
    }

    #[tokio::test]
    async fn ledger_events_accumulate() {
        let mut kit = TestKit::of(|_: &EntityContext| Ledger).expect("ledger kit should build");
        kit.call("Deposit", &Amount { amount: 40 })
            .await
            .expect("deposit should succeed");
        let result = kit
            .call("Withdraw", &Amount { amount: 15 })
            .await
            .expect("withdraw should succeed");

        assert_eq!(result.events(), &[LedgerEvent::Withdrawn { amount: 15 }]);
        assert_eq!(result.reply::<Balance>().expect("should reply"), Balance { balance: 25 });
        assert_eq!(result.side_effects().len(), 1);
        assert_eq!(
            kit.all_events(),
            &[
                LedgerEvent::Deposited { amount: 40 },
                LedgerEvent::Withdrawn { amount: 15 }
            ]
        );
        assert_eq!(kit.state().entries, 2);
    }

    #[tokio::test]
    async fn overdraft_keeps_its_code() {
        let mut kit = TestKit::of(|_: &EntityContext| Ledger).expect("ledger kit should build");
        let result = kit
            .call("Withdraw", &Amount { amount: 1 })
            .await
            .expect("call should succeed");
        assert_eq!(result.error().map(|r| r.code), Some(ErrorCode::FailedPrecondition));
        assert!(result.side_effects().is_empty());
        assert!(kit.all_events().is_empty());
    }

    #[tokio::test]
    async fn close_deletes_entity() {
        let mut kit = TestKit::of(|_: &EntityContext| Ledger).expect("ledger kit should build");
        kit.call("Deposit", &Amount { amount: 5 })
            .await
            .expect("deposit should succeed");
        let result = kit.call("Close", &Empty {}).await.expect("close should succeed");

        assert!(result.was_deleted());
        assert!(kit.is_deleted());
        assert_eq!(kit.state(), &LedgerState::default());
        assert_eq!(kit.all_events().last(), Some(&LedgerEvent::Closed));
    }

    #[tokio::test]
    async fn action_forward_is_reported() {
        let mut kit = TestKit::of(|_: &EntityContext| Greeter).expect("greeter kit should build");
        let result = kit
            .call("IncreaseCounter", &IncreaseValue { value: 3 })
            .await
            .expect("call should succeed");

        let call = result.forward().expect("should forward");
        assert_eq!(call.command, "Increase");
        assert!(call.metadata.get(crate::command::CORRELATION_ID_KEY).is_some());
        assert!(!result.is_reply());
    }

    #[tokio::test]
    async fn async_reply_is_resolved() {
        let mut kit = TestKit::of(|_: &EntityContext| Greeter).expect("greeter kit should build");
        let result = kit
            .call("GreetLater", &json!({"name": "Lin"}))
            .await
            .expect("call should succeed");
        assert_eq!(
            result.reply::<Greeting>().expect("should reply"),
            Greeting {
                message: "Hello later, Lin!".into()
            }
        );
    }

    #[tokio::test]
    async fn no_reply_cannot_be_decoded() {
        let mut kit = TestKit::of(|_: &EntityContext| Greeter).expect("greeter kit should build");
        let result = kit
            .call("Audit", &json!({}))
            .await
            .expect("call should succeed");
        assert!(result.is_no_reply());
        assert!(result.reply::<Empty>().is_err());
    }

    #[tokio::test]
    async fn view_rows_follow_change_notifications() {
        let mut kit =
            TestKit::of(|_: &EntityContext| LedgerSummaryView).expect("view kit should build");
        kit.call("OnDeposited", &Amount { amount: 30 })
            .await
            .expect("update should succeed");
        let result = kit
            .call("OnWithdrawn", &Amount { amount: 12 })
            .await
            .expect("update should succeed");

        assert!(result.is_no_reply());
        assert_eq!(
            kit.state(),
            &LedgerSummary {
                balance: 18,
                movements: 2
            }
        );

        let ignored = kit
            .call("OnDeposited", &Amount { amount: 0 })
            .await
            .expect("update should succeed");
        assert!(!ignored.state_was_updated());
        assert_eq!(kit.state().movements, 2);

        let closed = kit.call("OnClosed", &Empty {}).await.expect("update should succeed");
        assert!(closed.was_deleted());
        assert_eq!(kit.state(), &LedgerSummary::default());
    }

    #[tokio::test]
    async fn unknown_view_update_is_an_error() {
        let mut kit =
            TestKit::of(|_: &EntityContext| LedgerSummaryView).expect("view kit should build");
        let err = kit
            .call("OnFrozen", &Empty {})
            .await
            .expect_err("unknown update should fail");
        assert!(matches!(err, RouterError::UpdateHandlerNotFound { .. }));
    }

    #[tokio::test]
    async fn replicated_entity_updates_copy_on_write() {
        let mut kit = TestKit::of(|_: &EntityContext| Tally).expect("tally kit should build");
        kit.call("Add", &AddVotes { node: "n1".into(), votes: 2 })
            .await
            .expect("call should succeed");
        let result = kit
            .call("Add", &AddVotes { node: "n2".into(), votes: 5 })
            .await
            .expect("call should succeed");
        assert_eq!(result.reply::<u64>().expect("should reply"), 7);
        assert_eq!(kit.state().per_node.len(), 2);
    }
}
