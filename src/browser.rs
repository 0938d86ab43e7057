//! Browser automation capability the lookup runs on.
//!
//! `ShipmentLookupService` only talks to these traits; `crate::chromium`
//! provides the real Chrome-backed implementation and tests provide scripted
//! ones.

use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::LookupError;

/// Launches one isolated browser session per lookup.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, LookupError>;
}

/// A single browser with one open page.
///
/// Sessions are never shared between lookups. Callers must finish with
/// [`BrowserSession::close`].
#[async_trait]
pub trait BrowserSession: Send {
    async fn set_viewport(&mut self, width: u32, height: u32) -> Result<(), LookupError>;

    /// Forward every completed response whose URL matches `url_pattern`.
    ///
    /// The subscription lives as long as the session.
    async fn observe_responses(
        &mut self,
        url_pattern: Regex,
    ) -> Result<ResponseSubscription, LookupError>;

    /// Load `url` and wait for network quiescence, all within `timeout`.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), LookupError>;

    async fn evaluate(&mut self, script: &str) -> Result<(), LookupError>;

    async fn wait_for_network_idle(&mut self) -> Result<(), LookupError>;

    /// Text content of the first element matching `selector`, `None` when absent.
    async fn query_text(&mut self, selector: &str) -> Result<Option<String>, LookupError>;

    async fn wait_for_selector(&mut self, selector: &str) -> Result<(), LookupError>;

    async fn click(&mut self, selector: &str) -> Result<(), LookupError>;

    async fn close(self: Box<Self>) -> Result<(), LookupError>;
}

/// A response observed by the session, body already read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResponse {
    pub url: String,
    pub body: String,
}

/// Receiving end of [`BrowserSession::observe_responses`].
#[derive(Debug)]
pub struct ResponseSubscription {
    rx: mpsc::UnboundedReceiver<CapturedResponse>,
}

impl ResponseSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<CapturedResponse>) -> Self {
        Self { rx }
    }

    /// Create a connected sender/subscription pair.
    pub fn channel() -> (mpsc::UnboundedSender<CapturedResponse>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }

    /// Everything received so far, oldest first. Does not wait.
    pub fn drain(&mut self) -> Vec<CapturedResponse> {
        let mut responses = Vec::new();
        while let Ok(response) = self.rx.try_recv() {
            responses.push(response);
        }
        responses
    }
}

/// When the network counts as quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    pub max_inflight: usize,
    pub idle_time: Duration,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        IdlePolicy {
            max_inflight: 0,
            idle_time: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_in_arrival_order() {
        let (tx, mut subscription) = ResponseSubscription::channel();
        for n in 1..=3 {
            tx.send(CapturedResponse {
                url: format!("https://example.test/{}", n),
                body: n.to_string(),
            })
            .unwrap();
        }

        let bodies: Vec<_> = subscription.drain().into_iter().map(|r| r.body).collect();

        assert_eq!(bodies, vec!["1", "2", "3"]);
        assert!(subscription.drain().is_empty());
    }

    #[test]
    fn drain_survives_closed_sender() {
        let (tx, mut subscription) = ResponseSubscription::channel();
        tx.send(CapturedResponse { url: "u".into(), body: "b".into() }).unwrap();
        drop(tx);

        assert_eq!(subscription.drain().len(), 1);
    }
}
