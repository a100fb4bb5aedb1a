//! Handlers bundled with the binary.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::HandlerError;
use crate::registry::WebhookHandler;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contact {
    pub name: Option<String>,
    pub email: String,
}

/// Creates a contact per `contact.created` event, keyed by email.
///
/// A second delivery for the same email fails the way a unique index would,
/// so redeliveries are recorded as duplicates rather than failures.
#[derive(Debug, Default)]
pub struct ContactCreated {
    contacts: RwLock<BTreeMap<String, Contact>>,
}

impl ContactCreated {
    pub const NAME: &'static str = "ContactCreated";

    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, email: &str) -> Option<Contact> {
        self.contacts.read().await.get(&email.to_ascii_lowercase()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.contacts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contacts.read().await.is_empty()
    }
}

fn string_field(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl WebhookHandler for ContactCreated {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn handle(&self, data: &Map<String, Value>) -> Result<(), HandlerError> {
        let email = string_field(data, "email")
            .ok_or_else(|| HandlerError::new("InvalidArgument", "contact email is required"))?;
        let key = email.to_ascii_lowercase();

        let mut contacts = self.contacts.write().await;
        if contacts.contains_key(&key) {
            return Err(HandlerError::new(
                "UniqueViolation",
                format!(
                    "duplicate key value violates unique constraint \"contacts_email_key\" (email)=({key})"
                ),
            )
            .with_code("23505"));
        }

        let contact = Contact {
            name: string_field(data, "name"),
            email: key.clone(),
        };
        info!(email = %contact.email, name = ?contact.name, "contact created");
        contacts.insert(key, contact);
        Ok(())
    }
}

/// Every handler the binary can bind by name.
pub fn catalog() -> Vec<Arc<dyn WebhookHandler>> {
    vec![Arc::new(ContactCreated::new())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::is_duplicate_violation;
    use serde_json::json;

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn creates_contact() {
        let handler = ContactCreated::new();
        handler
            .handle(&data(json!({"name": "Ada Lovelace", "email": "Ada@Example.com"})))
            .await
            .unwrap();

        let contact = handler.get("ada@example.com").await.unwrap();
        assert_eq!(contact.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(handler.len().await, 1);
    }

    #[tokio::test]
    async fn second_delivery_is_a_duplicate() {
        let handler = ContactCreated::new();
        let payload = data(json!({"email": "ada@example.com"}));
        handler.handle(&payload).await.unwrap();

        let err = handler.handle(&payload).await.unwrap_err();
        assert!(is_duplicate_violation(&err));
        assert_eq!(handler.len().await, 1);
    }

    #[tokio::test]
    async fn missing_email_fails() {
        let handler = ContactCreated::new();
        let err = handler.handle(&data(json!({"name": "Ada"}))).await.unwrap_err();
        assert_eq!(err.kind, "InvalidArgument");
        assert!(!is_duplicate_violation(&err));
        assert!(handler.is_empty().await);
    }
}
