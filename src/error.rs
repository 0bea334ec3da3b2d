//! Crate-level error types for routing, registration, and calls.

use serde::{Deserialize, Serialize};

use crate::component::ComponentKind;
use crate::status::ErrorCode;

/// A command rejected by handler logic.
///
/// This is an expected business outcome, carried inside an error effect
/// and returned verbatim to the caller. It is never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{description}")]
pub struct Rejection {
    /// Human-readable reason, sent to the caller as-is.
    pub description: String,
    /// Status code for the transport.
    pub code: ErrorCode,
}

impl Rejection {
    /// A rejection with [`ErrorCode::InvalidArgument`].
    pub fn new(description: impl Into<String>) -> Self {
        Self::with_code(description, ErrorCode::default())
    }

    pub fn with_code(description: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            description: description.into(),
            code,
        }
    }
}

/// Failure of the future behind an async effect.
///
/// Surfaced to the caller as a [`Rejection`], with [`ErrorCode::Internal`]
/// unless the failure names a code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("async computation failed: {message}")]
pub struct AsyncFailure {
    pub message: String,
    pub code: Option<ErrorCode>,
}

impl AsyncFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Capture the display form of any error.
    pub fn from_error(err: &dyn std::error::Error) -> Self {
        Self::new(err.to_string())
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    /// The rejection the caller observes.
    pub fn into_rejection(self) -> Rejection {
        Rejection::with_code(self.message, self.code.unwrap_or(ErrorCode::Internal))
    }
}

impl From<Rejection> for AsyncFailure {
    fn from(rejection: Rejection) -> Self {
        Self {
            message: rejection.description,
            code: Some(rejection.code),
        }
    }
}

/// Misuse of the router or effect API.
///
/// These indicate a bug in component code. They are meant to be caught by
/// tests and are never recovered from at runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgrammingError {
    /// Two handlers were registered under the same command name.
    #[error("component '{component}' registers command '{command}' more than once")]
    DuplicateCommand { component: String, command: String },

    /// A handler was registered under an empty command name.
    #[error("component '{component}' registers a command with an empty name")]
    EmptyCommandName { component: String },

    /// An event sourced component was built without an event handler.
    #[error("event sourced component '{component}' has no event handler")]
    MissingEventHandler { component: String },

    /// An event handler was registered on a kind that has no events.
    #[error("{kind} '{component}' cannot register an event handler")]
    UnexpectedEventHandler {
        component: String,
        kind: ComponentKind,
    },

    /// An update handler was registered on a component that is not a view.
    #[error("{kind} '{component}' cannot register update handlers")]
    UnexpectedUpdateHandler {
        component: String,
        kind: ComponentKind,
    },

    /// A handler returned an update its component kind does not support.
    #[error("{kind} '{component}' returned an unsupported update: {update}")]
    UnsupportedUpdate {
        component: String,
        kind: ComponentKind,
        update: &'static str,
    },
}

/// Error returned when routing a command fails.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// No handler is registered under the command name.
    ///
    /// Indicates deployment or version skew between caller and component.
    #[error("no handler for command '{command}' on component '{component}'")]
    HandlerNotFound { component: String, command: String },

    /// No view update handler is registered under the name.
    #[error("no update handler '{update}' on view '{component}'")]
    UpdateHandlerNotFound { component: String, update: String },

    /// The payload does not decode into the handler's command type.
    #[error("payload for '{component}.{command}' does not match the command type: {source}")]
    PayloadMismatch {
        component: String,
        command: String,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid effect or router construction.
    #[error(transparent)]
    Programming(#[from] ProgrammingError),
}

/// Error returned when building a [`Registry`](crate::Registry).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// Another provider already uses this identifier.
    #[error("component '{component_id}' is registered more than once")]
    Duplicate { component_id: String },

    /// The provider has an empty identifier.
    #[error("component identifier must not be empty")]
    EmptyComponentId,

    /// The provider's router could not be built.
    #[error("component '{component_id}' is malformed: {source}")]
    Malformed {
        component_id: String,
        #[source]
        source: ProgrammingError,
    },
}

/// Error returned by [`Host::call`](crate::Host::call).
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// No provider is registered under the target identifier.
    #[error("unknown component '{0}'")]
    UnknownComponent(String),

    /// An entity was addressed without an entity identity.
    #[error("component '{component_id}' requires an entity id")]
    MissingEntityId { component_id: String },

    /// Routing or interpretation failed.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// The command was rejected by the handler or an async failure.
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// The actor owning the entity exited before replying.
    #[error("entity actor is no longer running")]
    ActorGone,

    /// A chain of forwards exceeded the configured depth.
    #[error("forward chain exceeded {depth} hops")]
    ForwardDepthExceeded { depth: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_displays_description() {
        let r = Rejection::new("increase value must be a positive number");
        assert_eq!(r.to_string(), "increase value must be a positive number");
        assert_eq!(r.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn async_failure_defaults_to_internal() {
        let r = AsyncFailure::new("timeout talking to pricing").into_rejection();
        assert_eq!(r.code, ErrorCode::Internal);
        assert_eq!(r.description, "timeout talking to pricing");
    }

    #[test]
    fn async_failure_keeps_rejection_code() {
        let failure = AsyncFailure::from(Rejection::with_code("gone", ErrorCode::NotFound));
        assert_eq!(failure.into_rejection().code, ErrorCode::NotFound);
    }

    #[test]
    fn async_failure_from_error_captures_message() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out");
        let failure = AsyncFailure::from_error(&io);
        assert!(failure.to_string().contains("upstream timed out"));
    }

    #[test]
    fn handler_not_found_display() {
        let err = RouterError::HandlerNotFound {
            component: "counter".into(),
            command: "Reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "no handler for command 'Reset' on component 'counter'"
        );
    }

    #[test]
    fn update_handler_not_found_names_the_view() {
        let err = RouterError::UpdateHandlerNotFound {
            component: "customers_by_city".into(),
            update: "UpdateCustomerMoved".into(),
        };
        assert_eq!(
            err.to_string(),
            "no update handler 'UpdateCustomerMoved' on view 'customers_by_city'"
        );
    }

    #[test]
    fn programming_error_is_transparent_in_router_error() {
        let inner = ProgrammingError::MissingEventHandler {
            component: "ledger".into(),
        };
        let err = RouterError::from(inner.clone());
        assert_eq!(err.to_string(), inner.to_string());
    }

    #[test]
    fn call_error_wraps_rejection() {
        let err = CallError::from(Rejection::new("nope"));
        assert!(matches!(err, CallError::Rejected(_)));
        assert_eq!(err.to_string(), "nope");
    }

    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<RouterError>();
            assert_send_sync::<RegistrationError>();
            assert_send_sync::<CallError>();
            assert_send_sync::<AsyncFailure>();
        }
    };
}
