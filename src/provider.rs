//! Providers bind a component type to its identifier and factory.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::error::ProgrammingError;
use crate::router::Router;

/// Identity handed to a factory when an instance is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityContext {
    pub component_id: String,
    /// `None` for actions.
    pub entity_id: Option<String>,
}

/// Per-component runtime options.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use entity_router::ComponentOptions;
///
/// let opts = ComponentOptions::default()
///     .with_idle_timeout(Duration::from_secs(30))
///     .forward_metadata_key("x-tenant");
///
/// assert_eq!(opts.idle_timeout, Some(Duration::from_secs(30)));
/// assert_eq!(opts.forward_metadata, vec!["x-tenant".to_string()]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentOptions {
    /// Passivation timeout for this component's entities. `None` uses the
    /// host default.
    pub idle_timeout: Option<Duration>,
    /// Metadata keys copied from a command onto the calls it forwards.
    pub forward_metadata: Vec<String>,
}

impl ComponentOptions {
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn forward_metadata_key(mut self, key: impl Into<String>) -> Self {
        self.forward_metadata.push(key.into());
        self
    }
}

type Factory<C> = Arc<dyn Fn(&EntityContext) -> C + Send + Sync>;

/// Binds `C::COMPONENT_ID` to a factory creating instances of `C`.
///
/// The factory runs once per entity activation (and once per call for
/// actions). It must not share mutable state between instances.
pub struct Provider<C: Component> {
    factory: Factory<C>,
    options: ComponentOptions,
}

impl<C: Component> Provider<C> {
    /// Bind `C::COMPONENT_ID` to `factory`, with default options.
    pub fn of<F>(factory: F) -> Self
    where
        F: Fn(&EntityContext) -> C + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            options: ComponentOptions::default(),
        }
    }

    /// Replace the default [`ComponentOptions`] (idle timeout, forwarded
    /// metadata keys).
    pub fn with_options(mut self, options: ComponentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn component_id(&self) -> &'static str {
        C::COMPONENT_ID
    }

    pub fn options(&self) -> &ComponentOptions {
        &self.options
    }

    /// Run the factory for one activation.
    pub fn new_instance(&self, ctx: &EntityContext) -> C {
        (self.factory)(ctx)
    }

    /// Build the router declared by `C`.
    pub fn router(&self) -> Result<Router<C>, ProgrammingError> {
        Router::of()
    }
}

impl<C: Component> Clone for Provider<C> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            options: self.options.clone(),
        }
    }
}

impl<C: Component> fmt::Debug for Provider<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("component_id", &C::COMPONENT_ID)
            .field("kind", &C::KIND)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
