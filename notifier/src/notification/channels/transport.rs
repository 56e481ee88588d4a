//! Provider transports.

use async_trait::async_trait;
use tracing::info;

/// The single send capability of an external gateway (SMTP relay, push gateway, SMS gateway).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, recipient: &str, title: &str, content: &str) -> bool;
}

/// Transport that only logs what would have been sent. Always succeeds.
#[derive(Debug, Clone)]
pub struct LoggingTransport {
    label: String,
}

impl LoggingTransport {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl Transport for LoggingTransport {
    async fn send(&self, recipient: &str, title: &str, content: &str) -> bool {
        info!(
            transport = %self.label,
            recipient = %recipient,
            content_len = content.len(),
            "Would send: {}",
            title
        );
        true
    }
}

/// Transport backed by a closure, for embedding and tests.
pub struct FnTransport<F> {
    f: F,
}

impl<F> FnTransport<F>
where
    F: Fn(&str, &str, &str) -> bool + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Transport for FnTransport<F>
where
    F: Fn(&str, &str, &str) -> bool + Send + Sync,
{
    async fn send(&self, recipient: &str, title: &str, content: &str) -> bool {
        (self.f)(recipient, title, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_transport_accepts() {
        let transport = LoggingTransport::new("smtp");
        assert!(transport.send("a@example.com", "t", "c").await);
    }

    #[tokio::test]
    async fn test_fn_transport() {
        let transport = FnTransport::new(|recipient: &str, _: &str, _: &str| recipient == "ok");
        assert!(transport.send("ok", "t", "c").await);
        assert!(!transport.send("nope", "t", "c").await);
    }
}
