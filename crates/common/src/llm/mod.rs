//! External language-model collaborator
//!
//! The LLM is strictly advisory: intent suggestions are re-validated by the
//! decomposer before they shape control flow, and synthesized narrative is
//! never treated as a source of numeric truth, only of phrasing. Both calls
//! are idempotent-safe so the orchestrator may retry them once.

use crate::config::LlmConfig;
use crate::errors::{PipelineError, Result};
use crate::model::{SubQueryKind, ValidatedBundle, VerdictStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A sub-query description proposed by the language model.
///
/// `depends_on` holds indices into the same suggestion list; the decomposer
/// resolves and validates them locally before anything is scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentSuggestion {
    /// Natural-language description of the sub-question
    pub description: String,

    pub kind: SubQueryKind,

    pub metric: Option<String>,

    pub period: Option<String>,

    #[serde(default)]
    pub depends_on: Vec<usize>,
}

/// Contract of the external language-model service
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Propose sub-query descriptions for a free-form question.
    /// Advisory only; the decomposer verifies structure locally.
    async fn extract_intents(&self, question: &str) -> Result<Vec<IntentSuggestion>>;

    /// Generate narrative text grounded in validated evidence bundles
    async fn synthesize(&self, question: &str, bundles: &[ValidatedBundle]) -> Result<String>;
}

/// Language-model client over a chat-completions style HTTP endpoint.
///
/// With no API key configured the client degrades to a deterministic
/// offline template grounded in the supplied bundles, which keeps the
/// pipeline exercisable in development and tests.
pub struct HttpLanguageModel {
    config: LlmConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl HttpLanguageModel {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { config, client })
    }

    fn has_api_key(&self) -> bool {
        self.config
            .api_key
            .as_deref()
            .map(|k| !k.is_empty())
            .unwrap_or(false)
    }

    async fn call_chat(&self, system: &str, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.api_key.as_deref().unwrap_or_default()),
            )
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::SynthesisTimeout {
                        timeout_ms: self.config.timeout_secs * 1000,
                    }
                } else {
                    PipelineError::LanguageModel {
                        message: format!("LLM request failed: {}", e),
                    }
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::LanguageModel {
                message: format!("LLM API error {}: {}", status, body),
            });
        }

        let chat: ChatResponse = response.json().await.map_err(|e| PipelineError::LanguageModel {
            message: format!("Failed to parse LLM response: {}", e),
        })?;

        chat.choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| PipelineError::LanguageModel {
                message: "Empty response from LLM".to_string(),
            })
    }

    fn build_synthesis_prompt(&self, question: &str, bundles: &[ValidatedBundle]) -> String {
        let mut prompt = format!(
            "You are a financial analyst. Answer the question based ONLY on the \
            evidence below. Numbers must come from the evidence values, never \
            invented. Cite evidence inline as [1], [2] referring to the numbered \
            entries. Mention when evidence was flagged or rejected.\n\n\
            Question: {}\n\nEvidence:\n",
            question
        );

        for (i, vb) in bundles.iter().enumerate() {
            prompt.push_str(&format!(
                "\n[{}] {} (verdict: {:?})\n",
                i + 1,
                vb.sub_query.text,
                vb.verdict.status
            ));
            for value in &vb.bundle.values {
                prompt.push_str(&format!(
                    "  {} = {} {}\n",
                    value.metric, value.value, value.unit
                ));
            }
            if !vb.bundle.narrative.is_empty() {
                prompt.push_str(&format!("  context: {}\n", vb.bundle.narrative));
            }
        }

        prompt.push_str("\nAnswer:");
        prompt
    }

    /// Deterministic narrative used when no API key is configured. Grounded
    /// in the same bundles the live path would see.
    fn offline_synthesize(&self, question: &str, bundles: &[ValidatedBundle]) -> String {
        let mut out = format!("Answer to \"{}\" based on the validated evidence:\n", question);

        for vb in bundles {
            for value in &vb.bundle.values {
                let rendered = if value.unit == "ratio" {
                    format!("{} ({}%)", value.value, value.value * 100.0)
                } else {
                    format!("{} {}", value.value, value.unit)
                };
                match vb.verdict.status {
                    VerdictStatus::Ok => {
                        out.push_str(&format!("- {} is {}.\n", value.metric, rendered));
                    }
                    VerdictStatus::Flagged => {
                        out.push_str(&format!(
                            "- {} is {} (flagged during validation).\n",
                            value.metric, rendered
                        ));
                    }
                    VerdictStatus::Rejected => {
                        out.push_str(&format!(
                            "- {} could not be validated and is withheld.\n",
                            value.metric
                        ));
                    }
                }
            }
        }

        if let Some(first_narrative) = bundles
            .iter()
            .map(|vb| vb.bundle.narrative.as_str())
            .find(|n| !n.is_empty())
        {
            let excerpt: String = first_narrative.chars().take(400).collect();
            out.push_str(&format!("Supporting context: {}\n", excerpt));
        }

        out
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn extract_intents(&self, question: &str) -> Result<Vec<IntentSuggestion>> {
        if !self.has_api_key() {
            // Nothing advisory to offer offline; the decomposer's own
            // heuristics carry the plan.
            return Ok(Vec::new());
        }

        let prompt = format!(
            "Decompose this financial question into sub-queries. Respond with a \
            JSON array of objects with fields: description, kind (one of \
            \"retrieval\", \"metric_computation\", \"comparison\"), metric, \
            period, depends_on (array of indices into this list).\n\n\
            Question: {}",
            question
        );

        let response = self
            .call_chat("You decompose financial questions into structured sub-queries.", &prompt)
            .await?;

        // The model may wrap the array in prose; cut to the outermost brackets.
        let start = response.find('[');
        let end = response.rfind(']');
        let json = match (start, end) {
            (Some(s), Some(e)) if e > s => &response[s..=e],
            _ => {
                return Err(PipelineError::LanguageModel {
                    message: "No JSON array in intent response".to_string(),
                })
            }
        };

        let suggestions: Vec<IntentSuggestion> =
            serde_json::from_str(json).map_err(|e| PipelineError::LanguageModel {
                message: format!("Unparseable intent response: {}", e),
            })?;

        tracing::debug!(
            count = suggestions.len(),
            "Language model proposed intents"
        );

        Ok(suggestions)
    }

    async fn synthesize(&self, question: &str, bundles: &[ValidatedBundle]) -> Result<String> {
        if !self.has_api_key() {
            return Ok(self.offline_synthesize(question, bundles));
        }

        let prompt = self.build_synthesis_prompt(question, bundles);
        let response = self
            .call_chat("You are a careful financial analyst.", &prompt)
            .await?;

        // Narrative is phrasing, not numeric truth. An answer that cites
        // no evidence at all is still returned, but flagged in the logs.
        if !bundles.is_empty() && citation_markers(&response).is_empty() {
            tracing::warn!("Synthesized narrative cites no evidence entries");
        }

        Ok(response)
    }
}

/// Distinct `[n]` citation markers referenced by synthesized text
fn citation_markers(text: &str) -> Vec<usize> {
    let pattern = regex_lite::Regex::new(r"\[(\d+)\]").unwrap();

    let mut markers: Vec<usize> = pattern
        .captures_iter(text)
        .filter_map(|cap| cap.get(1)?.as_str().parse().ok())
        .collect();
    markers.sort_unstable();
    markers.dedup();
    markers
}
