//! Delivery configuration: where a Request's result should be sent once ready.

use serde::{Deserialize, Serialize};

use crate::error::AdmitError;

/// Tagged union of delivery destinations, per `SPEC_FULL.md` §4.6.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryConfig {
    Webhook { url: String },
    Queue(QueueDelivery),
}

/// The two valid shapes of a queue destination. Exactly one may be used per
/// `SPEC_FULL.md` §4.6 — this is enforced structurally rather than re-validated, since each
/// variant already carries only the fields its shape allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueueDelivery {
    Named {
        queue_name: String,
    },
    Routed {
        exchange: String,
        routing_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        queue_name: Option<String>,
    },
}

impl DeliveryConfig {
    /// Revalidate a delivery config at the core boundary (`SPEC_FULL.md` §4.8: "the core
    /// revalidates the delivery config").
    pub fn validate(&self) -> Result<(), AdmitError> {
        match self {
            DeliveryConfig::Webhook { url } => validate_webhook_url(url),
            DeliveryConfig::Queue(QueueDelivery::Named { queue_name }) => {
                if queue_name.trim().is_empty() {
                    Err(AdmitError::ValidationFailed(
                        "queue_name must not be empty".into(),
                    ))
                } else {
                    Ok(())
                }
            }
            DeliveryConfig::Queue(QueueDelivery::Routed { routing_key, .. }) => {
                if routing_key.trim().is_empty() {
                    Err(AdmitError::ValidationFailed(
                        "exchange delivery requires a non-empty routing_key".into(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// The `(exchange, routing_key)` destination cache key for a queue delivery, or `None` for
    /// a webhook. Matches `SPEC_FULL.md` §4.6's cache key — a `Named` queue is cached under
    /// `("", queue_name)` since it has no exchange.
    pub fn queue_destination_key(&self) -> Option<(String, String)> {
        match self {
            DeliveryConfig::Webhook { .. } => None,
            DeliveryConfig::Queue(QueueDelivery::Named { queue_name }) => {
                Some((String::new(), queue_name.clone()))
            }
            DeliveryConfig::Queue(QueueDelivery::Routed {
                exchange,
                routing_key,
                ..
            }) => Some((exchange.clone(), routing_key.clone())),
        }
    }
}

fn validate_webhook_url(url: &str) -> Result<(), AdmitError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| AdmitError::ValidationFailed(format!("invalid webhook url: {e}")))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(AdmitError::ValidationFailed(
            "webhook url must be http or https".into(),
        ));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AdmitError::ValidationFailed("webhook url must have a host".into()))?;

    if host.is_empty() || (host != "localhost" && !host.contains('.')) {
        return Err(AdmitError::ValidationFailed(
            "webhook host must be 'localhost' or contain a dot".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_localhost_webhook() {
        let config = DeliveryConfig::Webhook {
            url: "http://localhost:4000/hook".into(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn accepts_dotted_host_webhook() {
        let config = DeliveryConfig::Webhook {
            url: "https://client.example.com/hook".into(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_dotless_non_localhost_webhook() {
        let config = DeliveryConfig::Webhook {
            url: "http://internalhost/hook".into(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_http_scheme() {
        let config = DeliveryConfig::Webhook {
            url: "ftp://example.com/hook".into(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_named_queue() {
        let config = DeliveryConfig::Queue(QueueDelivery::Named {
            queue_name: "results".into(),
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_routed_queue_without_routing_key() {
        let config = DeliveryConfig::Queue(QueueDelivery::Routed {
            exchange: "ex".into(),
            routing_key: "".into(),
            queue_name: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn queue_destination_key_distinguishes_named_from_routed() {
        let named = DeliveryConfig::Queue(QueueDelivery::Named {
            queue_name: "nope".into(),
        });
        assert_eq!(
            named.queue_destination_key(),
            Some((String::new(), "nope".to_string()))
        );

        let routed = DeliveryConfig::Queue(QueueDelivery::Routed {
            exchange: "ex".into(),
            routing_key: "rk".into(),
            queue_name: None,
        });
        assert_eq!(
            routed.queue_destination_key(),
            Some(("ex".to_string(), "rk".to_string()))
        );
    }
}
