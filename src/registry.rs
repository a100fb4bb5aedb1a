use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ConfigError, HandlerError};

/// Unit of logic invoked with the `data` mapping of a webhook event.
///
/// An `Err` whose text or kind marks a duplicate-key violation is treated as
/// "already applied" and recorded as success; anything else fails the job.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    /// Name recorded in the hit's `handler` column.
    fn name(&self) -> &str;

    async fn handle(&self, data: &Map<String, Value>) -> Result<(), HandlerError>;
}

/// Event type → handler lookup, built once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn WebhookHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `event` to `handler`, replacing any previous binding.
    pub fn register(mut self, event: impl Into<String>, handler: Arc<dyn WebhookHandler>) -> Self {
        self.handlers.insert(event.into(), handler);
        self
    }

    /// Build a registry from configured `(event, handler name)` bindings,
    /// resolving names against the available implementations.
    pub fn from_bindings<'a, I>(
        bindings: I,
        catalog: &[Arc<dyn WebhookHandler>],
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut registry = Self::new();
        for (event, handler_name) in bindings {
            let handler = catalog
                .iter()
                .find(|h| h.name() == handler_name)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownHandler {
                    event: event.to_string(),
                    handler: handler_name.to_string(),
                })?;
            registry = registry.register(event, handler);
        }
        Ok(registry)
    }

    pub fn resolve(&self, event: &str) -> Option<Arc<dyn WebhookHandler>> {
        self.handlers.get(event).cloned()
    }

    pub fn handler_name(&self, event: &str) -> Option<String> {
        self.handlers.get(event).map(|h| h.name().to_string())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Adapter turning a synchronous closure into a [`WebhookHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

pub fn handler_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn WebhookHandler>
where
    F: Fn(&Map<String, Value>) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler { name: name.into(), f })
}

#[async_trait]
impl<F> WebhookHandler for FnHandler<F>
where
    F: Fn(&Map<String, Value>) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, data: &Map<String, Value>) -> Result<(), HandlerError> {
        (self.f)(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_resolve_by_name() {
        let catalog = vec![handler_fn("ContactCreated", |_| Ok(()))];
        let registry =
            HandlerRegistry::from_bindings([("contact.created", "ContactCreated")], &catalog).unwrap();

        assert_eq!(registry.handler_name("contact.created").as_deref(), Some("ContactCreated"));
        assert!(registry.resolve("contact.deleted").is_none());
    }

    #[test]
    fn unknown_handler_is_rejected() {
        let err = HandlerRegistry::from_bindings([("label.created", "LabelCreated")], &[])
            .err()
            .unwrap();
        assert_eq!(
            err,
            ConfigError::UnknownHandler {
                event: "label.created".into(),
                handler: "LabelCreated".into(),
            }
        );
    }
}
