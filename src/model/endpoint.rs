//! The provider-side API path a Batch targets.

use serde::{Deserialize, Serialize};

/// Provider endpoint a Batch's Requests all target.
///
/// All Requests in one Batch share `(endpoint, model)` — this is the Aggregator's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Responses,
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
}

impl Endpoint {
    /// The provider URL path this endpoint corresponds to, used both when writing the batch
    /// file's `url` field and when building the provider client's request.
    pub fn as_path(&self) -> &'static str {
        match self {
            Endpoint::Responses => "/v1/responses",
            Endpoint::ChatCompletions => "/v1/chat/completions",
            Endpoint::Completions => "/v1/completions",
            Endpoint::Embeddings => "/v1/embeddings",
            Endpoint::Moderations => "/v1/moderations",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Responses => "responses",
            Endpoint::ChatCompletions => "chat_completions",
            Endpoint::Completions => "completions",
            Endpoint::Embeddings => "embeddings",
            Endpoint::Moderations => "moderations",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "responses" => Ok(Endpoint::Responses),
            "chat_completions" => Ok(Endpoint::ChatCompletions),
            "completions" => Ok(Endpoint::Completions),
            "embeddings" => Ok(Endpoint::Embeddings),
            "moderations" => Ok(Endpoint::Moderations),
            other => Err(format!("unknown endpoint: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for endpoint in [
            Endpoint::Responses,
            Endpoint::ChatCompletions,
            Endpoint::Completions,
            Endpoint::Embeddings,
            Endpoint::Moderations,
        ] {
            let s = endpoint.to_string();
            assert_eq!(s.parse::<Endpoint>().unwrap(), endpoint);
        }
    }
}
