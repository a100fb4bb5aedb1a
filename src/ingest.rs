//! Turning a raw HTTP delivery into a hit and a dispatchable envelope.
//!
//! Nothing here rejects input: missing provider, missing event and bodies
//! that are not JSON objects are all recorded, and the executor decides
//! what to do with them later.

use std::collections::BTreeMap;

use crate::types::{NewHit, NormalizedPayload};

pub const PROVIDER_HEADER: &str = "x-webhook-provider";
pub const EVENT_HEADER: &str = "x-webhook-event";

/// Event headers set by specific providers, checked before the generic one.
pub const PROVIDER_EVENT_HEADERS: &[&str] = &["stripe-event-type", "x-hubspot-event"];

/// Raw parts of an inbound webhook request.
#[derive(Debug, Clone, Default)]
pub struct IncomingWebhook {
    /// Provider taken from the URL path, if the route carried one.
    pub provider: Option<String>,
    /// Header names are expected lowercase, as `http::HeaderMap` yields them.
    pub headers: BTreeMap<String, Vec<String>>,
    /// `event` query parameter.
    pub query_event: Option<String>,
    pub body: Vec<u8>,
    pub ip: Option<String>,
}

impl IncomingWebhook {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_query_event(mut self, event: impl Into<String>) -> Self {
        self.query_event = Some(event.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Path segment first, then the `X-Webhook-Provider` header.
    pub fn resolve_provider(&self) -> Option<String> {
        self.provider
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| self.header(PROVIDER_HEADER).map(str::to_string))
    }

    /// Provider-specific header, generic header, query parameter, then the
    /// body's `event` key.
    pub fn resolve_event(&self, body: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
        PROVIDER_EVENT_HEADERS
            .iter()
            .find_map(|name| self.header(name))
            .or_else(|| self.header(EVENT_HEADER))
            .map(str::to_string)
            .or_else(|| self.query_event.clone().filter(|e| !e.is_empty()))
            .or_else(|| match body.get("event") {
                Some(serde_json::Value::String(event)) if !event.is_empty() => Some(event.clone()),
                _ => None,
            })
    }

    /// Split into the row to record and the envelope to dispatch.
    pub fn into_parts(self) -> (NewHit, NormalizedPayload) {
        let provider = self.resolve_provider();
        let mut hit = NewHit::from_raw(provider, None, &self.body, BTreeMap::new(), self.ip.clone());
        hit.event = self.resolve_event(&hit.payload);
        hit.headers = self.headers;

        let payload = NormalizedPayload::from_body(hit.event.clone(), &hit.payload);
        (hit, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_priority() {
        let body = br#"{"event":"from.body","data":{}}"#.to_vec();

        let incoming = IncomingWebhook::new(body.clone())
            .with_header("X-Webhook-Event", "generic")
            .with_header("Stripe-Event-Type", "stripe")
            .with_query_event("query");
        assert_eq!(incoming.into_parts().0.event.as_deref(), Some("stripe"));

        let incoming = IncomingWebhook::new(body.clone())
            .with_header("X-Webhook-Event", "generic")
            .with_query_event("query");
        assert_eq!(incoming.into_parts().0.event.as_deref(), Some("generic"));

        let incoming = IncomingWebhook::new(body.clone()).with_query_event("query");
        assert_eq!(incoming.into_parts().0.event.as_deref(), Some("query"));

        let incoming = IncomingWebhook::new(body);
        assert_eq!(incoming.into_parts().0.event.as_deref(), Some("from.body"));
    }

    #[test]
    fn provider_from_path_or_header() {
        let incoming = IncomingWebhook::new("{}").with_header("X-Webhook-Provider", "hubspot");
        assert_eq!(incoming.resolve_provider().as_deref(), Some("hubspot"));

        let incoming = incoming.with_provider("stripe");
        assert_eq!(incoming.resolve_provider().as_deref(), Some("stripe"));
    }

    #[test]
    fn malformed_body_still_normalizes() {
        let (hit, payload) = IncomingWebhook::new("<xml/>").into_parts();
        assert_eq!(hit.payload.get("raw"), Some(&json!("<xml/>")));
        assert_eq!(hit.event, None);
        assert_eq!(payload.event, "");
        assert_eq!(payload.data, json!({}));
    }

    #[test]
    fn data_is_taken_from_body() {
        let (_, payload) = IncomingWebhook::new(
            r#"{"event":"contact.created","data":{"email":"ada@example.com"}}"#,
        )
        .into_parts();
        assert_eq!(payload.event, "contact.created");
        assert_eq!(payload.data, json!({"email": "ada@example.com"}));
    }
}
