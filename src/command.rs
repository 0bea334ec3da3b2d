//! Command context, metadata, and call descriptors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered string multimap attached to commands, replies, and calls.
///
/// Keys are compared case-insensitively, matching header semantics.
/// Insertion order is preserved and a key may appear more than once.
///
/// # Examples
///
/// ```
/// use entity_router::Metadata;
///
/// let md = Metadata::default()
///     .with("x-tenant", "acme")
///     .with("x-trace", "t-1");
///
/// assert_eq!(md.get("X-Tenant"), Some("acme"));
/// assert_eq!(md.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    /// Append an entry and return the updated metadata.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(key, value);
        self
    }

    /// Append an entry, keeping existing entries for the same key.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Replace every entry for `key` with a single entry.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.remove(&key);
        self.entries.push((key, value.into()));
    }

    /// Remove every entry for `key`.
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    /// First value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All values recorded for `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy the entries whose key is listed in `keys` into a new metadata.
    pub(crate) fn select(&self, keys: &[String]) -> Metadata {
        let entries = self
            .entries
            .iter()
            .filter(|(k, _)| keys.iter().any(|wanted| wanted.eq_ignore_ascii_case(k)))
            .cloned()
            .collect();
        Metadata { entries }
    }

    /// Append all entries of `other` whose key is not already present.
    pub(crate) fn merge_missing(&mut self, other: &Metadata) {
        for (k, v) in &other.entries {
            if self.get(k).is_none() {
                self.entries.push((k.clone(), v.clone()));
            }
        }
    }
}

/// Read-only context handed to every command handler.
///
/// Carries the identity of the addressed entity and the caller's metadata.
/// It also builds [`DeferredCall`]s to other components; building a call
/// performs no I/O, the call only runs when returned inside an effect.
///
/// # Examples
///
/// ```
/// use entity_router::CommandContext;
///
/// let ctx = CommandContext::new("counter", "Increase")
///     .with_entity_id("c-1")
///     .with_correlation_id("req-abc-123");
///
/// assert_eq!(ctx.entity_id.as_deref(), Some("c-1"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identifier of the component handling the command.
    pub component_id: String,
    /// Entity identity; `None` for stateless components.
    pub entity_id: Option<String>,
    /// Name of the command being handled.
    pub command_name: String,
    /// Metadata supplied by the caller.
    pub metadata: Metadata,
    /// Correlation ID for tracing a request across components.
    pub correlation_id: Option<String>,
}

impl CommandContext {
    pub fn new(component_id: impl Into<String>, command_name: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            command_name: command_name.into(),
            ..Self::default()
        }
    }

    /// Set the addressed entity identity.
    pub fn with_entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    /// Set the caller metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Describe a call to another component.
    ///
    /// The returned call inherits this context's correlation ID so the
    /// runtime can keep the request chain together.
    ///
    /// # Arguments
    ///
    /// * `component_id` - Identifier of the target component.
    /// * `command` - Command name registered on the target.
    /// * `payload` - JSON body of the command.
    ///
    /// # Returns
    ///
    /// A call with no entity id; address an entity with
    /// [`DeferredCall::with_entity_id`].
    pub fn call(
        &self,
        component_id: impl Into<String>,
        command: impl Into<String>,
        payload: Value,
    ) -> DeferredCall {
        let mut call = DeferredCall::new(component_id, command, payload);
        if let Some(cid) = &self.correlation_id {
            call.metadata.set(CORRELATION_ID_KEY, cid.clone());
        }
        call
    }
}

/// Metadata key under which correlation IDs travel on deferred calls.
pub const CORRELATION_ID_KEY: &str = "x-correlation-id";

/// Descriptor of a call to another component.
///
/// Used as the target of a forward and as the body of a side effect.
/// Addresses a component by identifier and, for entities, an entity ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredCall {
    /// Target component identifier (must match a registered provider).
    pub component_id: String,
    /// Target entity identity; `None` for actions.
    pub entity_id: Option<String>,
    /// Command name on the target component.
    pub command: String,
    /// JSON-encoded command payload.
    pub payload: Value,
    /// Metadata sent with the call.
    pub metadata: Metadata,
}

impl DeferredCall {
    pub fn new(component_id: impl Into<String>, command: impl Into<String>, payload: Value) -> Self {
        Self {
            component_id: component_id.into(),
            entity_id: None,
            command: command.into(),
            payload,
            metadata: Metadata::default(),
        }
    }

    /// Address a specific entity of the target component.
    pub fn with_entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    /// Attach `metadata` to the call.
    ///
    /// Keys in `metadata` replace entries of the same name; every other
    /// entry already on the call is kept, so a call built with
    /// [`CommandContext::call`] still carries the correlation id.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        let mut merged = metadata;
        merged.merge_missing(&self.metadata);
        self.metadata = merged;
        self
    }
}

/// A call the runtime performs after a command commits successfully.
///
/// Synchronous side effects complete before the reply is returned to the
/// caller; asynchronous ones are started and not awaited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffect {
    pub call: DeferredCall,
    pub synchronous: bool,
}

impl SideEffect {
    /// A fire-and-forget side effect.
    pub fn of(call: DeferredCall) -> Self {
        Self {
            call,
            synchronous: false,
        }
    }

    /// A side effect that completes before the reply is sent.
    pub fn synchronous(call: DeferredCall) -> Self {
        Self {
            call,
            synchronous: true,
        }
    }
}

/// Reply type for commands that return nothing of interest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_context_has_no_identity() {
        let ctx = CommandContext::default();
        assert_eq!(ctx.entity_id, None);
        assert_eq!(ctx.correlation_id, None);
        assert!(ctx.metadata.is_empty());
    }

    #[test]
    fn builder_chains_all_fields() {
        let ctx = CommandContext::new("cart", "AddItem")
            .with_entity_id("cart-7")
            .with_correlation_id("req-abc")
            .with_metadata(Metadata::default().with("source", "test"));

        assert_eq!(ctx.component_id, "cart");
        assert_eq!(ctx.command_name, "AddItem");
        assert_eq!(ctx.entity_id.as_deref(), Some("cart-7"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc"));
        assert_eq!(ctx.metadata.get("source"), Some("test"));
    }

    #[test]
    fn metadata_keys_are_case_insensitive() {
        let md = Metadata::default().with("Content-Type", "json");
        assert_eq!(md.get("content-type"), Some("json"));
    }

    #[test]
    fn metadata_keeps_repeated_keys_in_order() {
        let md = Metadata::default().with("tag", "a").with("tag", "b");
        let tags: Vec<_> = md.get_all("tag").collect();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn metadata_set_replaces_all_entries() {
        let mut md = Metadata::default().with("tag", "a").with("tag", "b");
        md.set("TAG", "c");
        let tags: Vec<_> = md.get_all("tag").collect();
        assert_eq!(tags, vec!["c"]);
    }

    #[test]
    fn select_copies_only_listed_keys() {
        let md = Metadata::default()
            .with("x-tenant", "acme")
            .with("authorization", "secret");
        let selected = md.select(&["X-Tenant".to_string()]);
        assert_eq!(selected.get("x-tenant"), Some("acme"));
        assert_eq!(selected.get("authorization"), None);
    }

    #[test]
    fn merge_missing_does_not_override() {
        let mut md = Metadata::default().with("k", "mine");
        md.merge_missing(&Metadata::default().with("k", "theirs").with("j", "new"));
        assert_eq!(md.get("k"), Some("mine"));
        assert_eq!(md.get("j"), Some("new"));
    }

    #[test]
    fn context_call_inherits_correlation_id() {
        let ctx = CommandContext::new("orders", "Place").with_correlation_id("corr-9");
        let call = ctx
            .call("inventory", "Reserve", json!({"sku": "x"}))
            .with_entity_id("sku-x");

        assert_eq!(call.component_id, "inventory");
        assert_eq!(call.entity_id.as_deref(), Some("sku-x"));
        assert_eq!(call.metadata.get(CORRELATION_ID_KEY), Some("corr-9"));
    }

    #[test]
    fn extra_metadata_keeps_inherited_correlation_id() {
        let ctx = CommandContext::new("orders", "Place").with_correlation_id("corr-9");
        let call = ctx
            .call("inventory", "Reserve", json!({}))
            .with_metadata(Metadata::default().with("x-tenant", "acme"));

        assert_eq!(call.metadata.get(CORRELATION_ID_KEY), Some("corr-9"));
        assert_eq!(call.metadata.get("x-tenant"), Some("acme"));
    }

    #[test]
    fn explicit_correlation_id_replaces_inherited_one() {
        let ctx = CommandContext::new("orders", "Place").with_correlation_id("corr-9");
        let call = ctx
            .call("inventory", "Reserve", json!({}))
            .with_metadata(Metadata::default().with(CORRELATION_ID_KEY, "corr-override"));

        assert_eq!(
            call.metadata.get_all(CORRELATION_ID_KEY).collect::<Vec<_>>(),
            vec!["corr-override"]
        );
    }

    #[test]
    fn side_effect_constructors_set_mode() {
        let call = DeferredCall::new("audit", "Record", json!({}));
        assert!(!SideEffect::of(call.clone()).synchronous);
        assert!(SideEffect::synchronous(call).synchronous);
    }

    #[test]
    fn deferred_call_serde_roundtrip() {
        let call = DeferredCall::new("counter", "Increase", json!({"value": 1}))
            .with_entity_id("c-1")
            .with_metadata(Metadata::default().with("a", "b"));

        let json = serde_json::to_string(&call).expect("serialization should succeed");
        let back: DeferredCall = serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back, call);
    }

    #[test]
    fn empty_serializes_to_empty_object() {
        assert_eq!(serde_json::to_value(Empty {}).unwrap(), json!({}));
    }
}
