use actix_web::http::header::HeaderMap as InboundHeaderMap;
use opentelemetry::propagation::{Extractor, Injector};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::trace;

/// Read side of trace context propagation over inbound request headers
pub struct InboundHeaders<'a>(pub &'a InboundHeaderMap);

impl Extractor for InboundHeaders<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

/// Write side of trace context propagation onto outbound request headers
pub struct OutboundHeaders<'a>(pub &'a mut HeaderMap);

impl Injector for OutboundHeaders<'_> {
    fn set(&mut self, key: &str, value: String) {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                self.0.insert(name, value);
            }
            _ => trace!(key, "Skipping unrepresentable propagation header"),
        }
    }
}
