//! `qa-scorer`: llm-evaluator scoring the text payload through an
//! OpenAI-compatible chat endpoint and writing the score into the Sample
//! bag.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::OperatorFailure;
use crate::operator::{Operator, OperatorKind, OperatorOptions, OperatorOutput};
use crate::sample::Sample;

/// Failure code for a failed or non-2xx model request.
const CODE_REQUEST_FAILED: i64 = 3001;

/// Failure code for an unparsable model reply.
const CODE_BAD_REPLY: i64 = 3002;

/// Bag key the score is written to unless overridden.
const DEFAULT_ATTR_KEY: &str = "qa_score";

/// Default model when the options carry none.
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// System prompt steering the model toward a bare numeric reply.
const SCORING_PROMPT: &str = "You are a data-quality rater. Rate the quality of the \
following text for use as training data on a scale from 0.0 to 1.0. Reply with only \
the number.";

/// LLM evaluator posting the payload to a chat-completions endpoint.
#[derive(Debug)]
pub struct QaScorer {
    api_base: String,
    api_key: Option<String>,
    model: String,
    attr_key: String,
    http_client: Client,
}

impl QaScorer {
    /// Registered operator name.
    pub const NAME: &'static str = "qa-scorer";

    /// Builds the operator from its options.
    ///
    /// Options:
    /// - `api_base` (string, required): base URL of the chat endpoint.
    /// - `api_key` (string, optional): bearer token.
    /// - `model` (string, default "gpt-4o-mini").
    /// - `attr_key` (string, default "qa_score"): bag key for the score.
    pub fn new(options: &OperatorOptions) -> Result<Self, String> {
        let api_base: String = options.require("api_base")?;
        let http_client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;

        Ok(Self {
            api_base,
            api_key: options.get("api_key"),
            model: options.get_or("model", DEFAULT_MODEL.to_string()),
            attr_key: options.get_or("attr_key", DEFAULT_ATTR_KEY.to_string()),
            http_client,
        })
    }

    /// Base URL of the configured endpoint.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    async fn score(&self, text: &str) -> Result<f64, OperatorFailure> {
        let request = ApiRequest {
            model: self.model.clone(),
            messages: vec![
                ApiMessage {
                    role: "system".to_string(),
                    content: SCORING_PROMPT.to_string(),
                },
                ApiMessage {
                    role: "user".to_string(),
                    content: text.to_string(),
                },
            ],
            temperature: 0.0,
            max_tokens: 8,
        };

        let url = format!("{}/chat/completions", self.api_base);
        let mut http_request = self.http_client.post(&url).json(&request);
        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = http_request.send().await.map_err(|e| {
            OperatorFailure::new(CODE_REQUEST_FAILED, format!("model request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OperatorFailure::new(
                CODE_REQUEST_FAILED,
                format!("model endpoint returned {}: {}", status.as_u16(), body),
            ));
        }

        let reply: ApiResponse = response.json().await.map_err(|e| {
            OperatorFailure::new(CODE_BAD_REPLY, format!("unparsable model reply: {}", e))
        })?;

        let content = reply
            .choices
            .first()
            .map(|c| c.message.content.trim())
            .ok_or_else(|| OperatorFailure::new(CODE_BAD_REPLY, "model reply had no choices"))?;

        parse_score(content)
            .ok_or_else(|| OperatorFailure::new(CODE_BAD_REPLY, format!("not a score: {content:?}")))
    }
}

/// Extracts a score in [0, 1] from the model's reply.
fn parse_score(content: &str) -> Option<f64> {
    let score: f64 = content
        .trim()
        .trim_end_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()?;
    (0.0..=1.0).contains(&score).then_some(score)
}

pub(super) fn factory(options: &OperatorOptions) -> Result<Box<dyn Operator>, String> {
    Ok(Box::new(QaScorer::new(options)?))
}

#[async_trait]
impl Operator for QaScorer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::LlmEvaluator
    }

    async fn execute(&self, mut sample: Sample) -> Result<OperatorOutput, OperatorFailure> {
        let score = self.score(&sample.text).await?;
        sample.set_attr(&self.attr_key, score);
        Ok(OperatorOutput::One(sample))
    }
}

/// Wire request for the OpenAI-compatible API.
#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

/// Wire response from the OpenAI-compatible API.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}
