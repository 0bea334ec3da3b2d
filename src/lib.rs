//! Command routing and effect interpretation for actor-style components.
//!
//! Components (actions, value entities, event sourced entities, replicated
//! entities and views) register typed handlers on a [`Router`].
//! Handlers return an [`Effect`] describing what should happen; a runtime
//! interprets it afterwards. [`Host`] is an in-memory runtime and
//! [`TestKit`] a single-entity harness for tests.

mod actor;
mod command;
pub use command::{CORRELATION_ID_KEY, CommandContext, DeferredCall, Empty, Metadata, SideEffect};
mod component;
pub use component::{Component, ComponentKind};
mod effect;
pub use effect::{Effect, EffectFuture, NoEvents, OnSuccess, Outcome, StateChange, UpdateEffect};
mod error;
pub use error::{
    AsyncFailure, CallError, ProgrammingError, RegistrationError, Rejection, RouterError,
};
mod host;
pub use host::{
    DEFAULT_IDLE_TIMEOUT, DEFAULT_MAILBOX_CAPACITY, DEFAULT_MAX_FORWARD_DEPTH, Host, HostBuilder,
    HostConfig, Response,
};
mod provider;
pub use provider::{ComponentOptions, EntityContext, Provider};
mod registry;
pub use registry::{Registration, Registry};
mod router;
pub use router::{Applied, Committed, RoutedEffect, Router, RouterBuilder};
mod status;
pub use status::ErrorCode;
mod testkit;
pub use testkit::{DEFAULT_TEST_ENTITY_ID, TestKit, TestResult};
