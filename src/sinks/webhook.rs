//! HTTP webhook sink.
//!
//! Grounded in `http::ReqwestHttpClient`: one shared `reqwest::Client`, per-call timeout,
//! `#[tracing::instrument]`, status mapped to an `Outcome` rather than bubbled as a raw error.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{Outcome, Sink};
use crate::error::Result;
use crate::model::DeliveryConfig;

#[derive(Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for WebhookSink {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Sink for WebhookSink {
    #[tracing::instrument(skip(self, payload))]
    async fn deliver(&self, config: &DeliveryConfig, payload: &Value) -> Result<Outcome> {
        let DeliveryConfig::Webhook { url } = config else {
            return Ok(Outcome::Other("webhook sink invoked with non-webhook config".into()));
        };

        let result = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                tracing::warn!(url = %url, "webhook delivery timed out");
                return Ok(Outcome::Timeout);
            }
            Err(e) if e.is_connect() => {
                tracing::warn!(url = %url, error = %e, "webhook connection failed");
                return Ok(Outcome::ConnectionError);
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "webhook request failed");
                return Ok(Outcome::Other(e.to_string()));
            }
        };

        let status = response.status();
        if status.is_success() {
            tracing::info!(url = %url, status = status.as_u16(), "webhook delivered");
            return Ok(Outcome::Success);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Ok(Outcome::AuthorizationError);
        }

        tracing::warn!(url = %url, status = status.as_u16(), "webhook returned non-2xx");
        Ok(Outcome::HttpStatusNot2xx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn success_response_yields_success_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sink = WebhookSink::default();
        let config = DeliveryConfig::Webhook {
            url: format!("{}/hook", server.uri()),
        };
        let outcome = sink.deliver(&config, &serde_json::json!({"ok": true})).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn server_error_yields_transient_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = WebhookSink::default();
        let config = DeliveryConfig::Webhook {
            url: format!("{}/hook", server.uri()),
        };
        let outcome = sink.deliver(&config, &serde_json::json!({})).await.unwrap();
        assert_eq!(outcome, Outcome::HttpStatusNot2xx);
        assert!(outcome.is_transient());
    }

    #[tokio::test]
    async fn unauthorized_is_non_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let sink = WebhookSink::default();
        let config = DeliveryConfig::Webhook {
            url: format!("{}/hook", server.uri()),
        };
        let outcome = sink.deliver(&config, &serde_json::json!({})).await.unwrap();
        assert_eq!(outcome, Outcome::AuthorizationError);
        assert!(!outcome.is_transient());
    }
}
