//! Narration producer client.
//!
//! Thin reqwest wrapper over an OpenAI-compatible chat completions
//! endpoint. The engine never blocks a session lock on this round-trip;
//! callers invoke it between storage operations.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::LlmSettings;

use super::error::{EngineError, EngineResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Raw reply from the narration producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmReply {
    pub content: String,
    /// Token accounting as reported by the endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<HashMap<String, u64>>,
}

#[derive(Clone)]
pub struct LlmClient {
    settings: LlmSettings,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { settings, http }
    }

    /// Whether a narration endpoint is configured at all.
    pub fn is_configured(&self) -> bool {
        self.settings.endpoint.is_some()
    }

    /// One chat round: system prompt plus a JSON context blob as the
    /// user message. Returns the assistant text and usage counters.
    pub async fn chat(&self, prompt: &str, context: &Value) -> EngineResult<LlmReply> {
        let endpoint = self
            .settings
            .endpoint
            .as_deref()
            .ok_or_else(|| EngineError::Unavailable("narration endpoint not configured".into()))?;

        let body = json!({
            "model": self.settings.model,
            "messages": [
                {"role": "system", "content": prompt},
                {"role": "user", "content": serde_json::to_string(context)?},
            ],
            "temperature": 0.7,
        });

        let mut request = self.http.post(endpoint).json(&body);
        if let Some(key) = &self.settings.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::internal(format!("narration request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::internal(format!(
                "narration endpoint returned {}",
                response.status()
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| EngineError::internal(format!("narration response unreadable: {e}")))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let usage = payload.get("usage").and_then(|u| u.as_object()).map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), n)))
                .collect()
        });

        Ok(LlmReply { content, usage })
    }
}
