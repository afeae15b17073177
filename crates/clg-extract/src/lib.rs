//! Extraction collaborator for CLG: turns a freeform campaign description
//! into an untrusted [`RawCampaignFields`] record.
//!
//! The language-model service is treated as unreliable: any transport,
//! status, or response-shape problem is an [`ExtractError`] the pipeline
//! surfaces per row. No NLU happens locally.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clg_core::RawCampaignFields;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "clg-extract";

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4";
const EXTRACT_FUNCTION_NAME: &str = "extract_campaign_fields";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("extraction service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed extraction response: {0}")]
    MalformedResponse(String),
    #[error("no fixture extraction recorded for input: {0}")]
    UnknownInput(String),
}

/// A collaborator that extracts structured campaign fields from free text.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    fn extractor_id(&self) -> &'static str;

    async fn extract(&self, line: &str) -> Result<RawCampaignFields, ExtractError>;
}

// ─── OpenAI-backed extractor ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct OpenAiExtractor {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiExtractor {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building extraction http client")?;
        Ok(Self { client, config })
    }

    fn request_body(&self, line: &str) -> Value {
        json!({
            "model": self.config.model,
            "messages": [
                {
                    "role": "system",
                    "content": "Extract structured campaign parameters for link generation."
                },
                { "role": "user", "content": line }
            ],
            "tools": [{
                "type": "function",
                "function": {
                    "name": EXTRACT_FUNCTION_NAME,
                    "description": "Extracts structured campaign fields from free text.",
                    "parameters": field_schema()
                }
            }],
            "tool_choice": {
                "type": "function",
                "function": { "name": EXTRACT_FUNCTION_NAME }
            }
        })
    }
}

#[async_trait]
impl FieldExtractor for OpenAiExtractor {
    fn extractor_id(&self) -> &'static str {
        "openai"
    }

    async fn extract(&self, line: &str) -> Result<RawCampaignFields, ExtractError> {
        let url = format!("{}/chat/completions", self.config.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(line))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = response.json().await?;
        debug!(model = %self.config.model, "extraction response received");
        parse_function_arguments(&value)
    }
}

/// JSON schema for the extraction function call, mirroring the
/// [`RawCampaignFields`] contract. Every field is declared required so the
/// model always emits the full shape; local validation still re-checks.
fn field_schema() -> Value {
    let string_fields = [
        "brand",
        "region",
        "platform",
        "campaign",
        "budget_code",
        "agency",
        "buying_platform",
        "publisher",
        "publisher_subsite",
        "targeting",
        "vertical",
        "offer",
        "subtargeting",
        "x_field",
        "lp_url",
    ];
    let mut properties = serde_json::Map::new();
    for field in string_fields {
        properties.insert(field.to_string(), json!({ "type": "string" }));
    }
    properties.insert(
        "formats".to_string(),
        json!({ "type": "array", "items": { "type": "string" } }),
    );
    let mut required: Vec<&str> = string_fields.to_vec();
    required.push("formats");
    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

/// Pull the function-call arguments out of a chat-completions response.
/// Accepts both the tool-calls shape and the legacy function_call shape.
fn parse_function_arguments(value: &Value) -> Result<RawCampaignFields, ExtractError> {
    let message = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| ExtractError::MalformedResponse("no choices[0].message".into()))?;

    let arguments = message
        .get("tool_calls")
        .and_then(|calls| calls.get(0))
        .and_then(|call| call.get("function"))
        .and_then(|f| f.get("arguments"))
        .or_else(|| {
            message
                .get("function_call")
                .and_then(|f| f.get("arguments"))
        })
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ExtractError::MalformedResponse("no function-call arguments in response".into())
        })?;

    serde_json::from_str(arguments)
        .map_err(|e| ExtractError::MalformedResponse(format!("invalid arguments payload: {e}")))
}

// ─── Fixture-backed extractor ──────────────────────────────────────────────

/// Canned extractions keyed by the exact input line. Used for offline runs
/// and tests; an input with no recorded extraction is an error, matching
/// the unreliable-collaborator contract.
#[derive(Debug, Clone, Default)]
pub struct FixtureExtractor {
    responses: HashMap<String, RawCampaignFields>,
}

impl FixtureExtractor {
    pub fn new(responses: HashMap<String, RawCampaignFields>) -> Self {
        Self { responses }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let responses =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self { responses })
    }
}

#[async_trait]
impl FieldExtractor for FixtureExtractor {
    fn extractor_id(&self) -> &'static str {
        "fixture"
    }

    async fn extract(&self, line: &str) -> Result<RawCampaignFields, ExtractError> {
        self.responses
            .get(line)
            .cloned()
            .ok_or_else(|| ExtractError::UnknownInput(line.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_all_fields_required() {
        let schema = field_schema();
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 16);
        assert!(required.iter().any(|v| v == "formats"));
        assert!(schema["properties"]["lp_url"]["type"] == "string");
    }

    #[test]
    fn parses_tool_call_response() {
        let value = json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "function": {
                            "name": EXTRACT_FUNCTION_NAME,
                            "arguments": "{\"brand\":\"PS\",\"formats\":[\"VOD6\"]}"
                        }
                    }]
                }
            }]
        });
        let raw = parse_function_arguments(&value).unwrap();
        assert_eq!(raw.brand.as_deref(), Some("PS"));
        assert_eq!(raw.formats, vec!["VOD6".to_string()]);
    }

    #[test]
    fn parses_legacy_function_call_response() {
        let value = json!({
            "choices": [{
                "message": {
                    "function_call": { "arguments": "{\"region\":\"UK\"}" }
                }
            }]
        });
        let raw = parse_function_arguments(&value).unwrap();
        assert_eq!(raw.region.as_deref(), Some("UK"));
    }

    #[test]
    fn malformed_response_is_an_error() {
        let err = parse_function_arguments(&json!({ "choices": [] })).unwrap_err();
        assert!(matches!(err, ExtractError::MalformedResponse(_)));

        let err = parse_function_arguments(&json!({
            "choices": [{ "message": { "content": "plain text, no call" } }]
        }))
        .unwrap_err();
        assert!(matches!(err, ExtractError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn fixture_extractor_misses_are_errors() {
        let mut responses = HashMap::new();
        responses.insert(
            "display in UK".to_string(),
            RawCampaignFields {
                brand: Some("PS".into()),
                ..Default::default()
            },
        );
        let extractor = FixtureExtractor::new(responses);
        assert!(extractor.extract("display in UK").await.is_ok());
        let err = extractor.extract("unseen line").await.unwrap_err();
        assert!(matches!(err, ExtractError::UnknownInput(_)));
    }
}
