//! Stage agents — one per pipeline stage, all sharing the same shape:
//! a prompt template, a bound capability provider, and a typed parser
//! with a single retry on malformed output.

pub mod cpt;
pub mod doctor;
pub mod icd;
pub mod parse;
pub mod summary;
pub mod symptom;

pub use cpt::CptAgent;
pub use doctor::DoctorAgent;
pub use icd::IcdAgent;
pub use summary::SummaryAgent;
pub use symptom::SymptomAgent;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::StageName;
use crate::providers::{CapabilityProvider, GenerateParams, ProviderError};

/// How the single retry after a parse failure is prompted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPromptMode {
    /// Re-send the original prompt unchanged.
    Same,
    /// Append a strict formatting reminder to the original prompt.
    #[default]
    Corrective,
}

impl std::str::FromStr for RetryPromptMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "same" => Ok(RetryPromptMode::Same),
            "corrective" => Ok(RetryPromptMode::Corrective),
            other => Err(format!("unknown retry prompt mode: {other}")),
        }
    }
}

const CORRECTIVE_REMINDER: &str = "\n\nYour previous reply was not valid. Respond again with ONLY the JSON object described above — no prose, no code fences.";

/// One answered clarifying question, kept on the session and replayed
/// into subsequent stage prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaExchange {
    pub stage: StageName,
    pub question: String,
    pub answer: String,
}

/// Errors from a stage agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The backend call itself failed. Not retried by the core — retry
    /// policy, if any, belongs to the provider implementation.
    #[error("{stage} stage backend call failed: {source}")]
    Provider {
        stage: StageName,
        #[source]
        source: ProviderError,
    },

    /// The model's output stayed unparseable after the retry.
    #[error("{stage} stage returned unparseable output: {reason}")]
    Parse { stage: StageName, reason: String },
}

impl AgentError {
    pub fn stage(&self) -> StageName {
        match self {
            AgentError::Provider { stage, .. } => *stage,
            AgentError::Parse { stage, .. } => *stage,
        }
    }
}

/// Run one generation and parse it, retrying once on parse failure.
///
/// Provider errors propagate immediately; parse errors trigger exactly
/// one retry whose prompt is shaped by `retry_mode`.
pub(crate) async fn generate_parsed<T>(
    provider: &dyn CapabilityProvider,
    stage: StageName,
    model: &str,
    prompt: &str,
    params: &GenerateParams,
    retry_mode: RetryPromptMode,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<T, AgentError> {
    let raw = provider
        .generate(model, prompt, params)
        .await
        .map_err(|source| AgentError::Provider { stage, source })?;

    let first_reason = match parse(&raw) {
        Ok(parsed) => return Ok(parsed),
        Err(reason) => reason,
    };

    tracing::debug!(%stage, reason = %first_reason, "parse failed, retrying once");

    let retry_prompt = match retry_mode {
        RetryPromptMode::Same => prompt.to_string(),
        RetryPromptMode::Corrective => format!("{prompt}{CORRECTIVE_REMINDER}"),
    };

    let raw = provider
        .generate(model, &retry_prompt, params)
        .await
        .map_err(|source| AgentError::Provider { stage, source })?;

    parse(&raw).map_err(|reason| AgentError::Parse { stage, reason })
}

/// Render Q&A history the way stage prompts expect it.
pub(crate) fn qa_section(history: &[QaExchange]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let exchanges: Vec<String> = history
        .iter()
        .map(|qa| format!("Q: {} A: {}", qa.question, qa.answer))
        .collect();
    format!("Previous Q&A: {}", exchanges.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;

    fn parse_number(text: &str) -> Result<u32, String> {
        text.trim().parse().map_err(|_| "not a number".to_string())
    }

    #[tokio::test]
    async fn first_attempt_success_skips_retry() {
        let provider = MockProvider::new("42");
        let result = generate_parsed(
            &provider,
            StageName::Icd,
            "m",
            "count",
            &GenerateParams::default(),
            RetryPromptMode::Corrective,
            parse_number,
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn parse_failure_retries_once_with_corrective_prompt() {
        let provider = MockProvider::new("42");
        provider.push_response("garbage");

        let result = generate_parsed(
            &provider,
            StageName::Icd,
            "m",
            "count",
            &GenerateParams::default(),
            RetryPromptMode::Corrective,
            parse_number,
        )
        .await
        .unwrap();
        assert_eq!(result, 42);

        let prompts = provider.prompts();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0], "count");
        assert!(prompts[1].starts_with("count"));
        assert!(prompts[1].contains("ONLY the JSON object"));
    }

    #[tokio::test]
    async fn same_mode_retries_with_identical_prompt() {
        let provider = MockProvider::new("42");
        provider.push_response("garbage");

        generate_parsed(
            &provider,
            StageName::Cpt,
            "m",
            "count",
            &GenerateParams::default(),
            RetryPromptMode::Same,
            parse_number,
        )
        .await
        .unwrap();

        let prompts = provider.prompts();
        assert_eq!(prompts, vec!["count", "count"]);
    }

    #[tokio::test]
    async fn second_parse_failure_is_terminal() {
        let provider = MockProvider::new("still garbage");
        provider.push_response("garbage");

        let err = generate_parsed(
            &provider,
            StageName::Icd,
            "m",
            "count",
            &GenerateParams::default(),
            RetryPromptMode::Corrective,
            parse_number,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            AgentError::Parse {
                stage: StageName::Icd,
                ..
            }
        ));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn provider_error_is_not_retried() {
        let provider = MockProvider::new("42");
        provider.push_error(ProviderError::Upstream {
            status: 502,
            body: "bad gateway".into(),
        });

        let err = generate_parsed(
            &provider,
            StageName::Doctor,
            "m",
            "count",
            &GenerateParams::default(),
            RetryPromptMode::Corrective,
            parse_number,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AgentError::Provider { .. }));
        assert_eq!(provider.call_count(), 1);
    }

    #[test]
    fn qa_section_renders_history() {
        let history = vec![
            QaExchange {
                stage: StageName::Icd,
                question: "How long?".into(),
                answer: "3 days".into(),
            },
            QaExchange {
                stage: StageName::Cpt,
                question: "Any imaging done?".into(),
                answer: "No".into(),
            },
        ];
        let text = qa_section(&history);
        assert_eq!(
            text,
            "Previous Q&A: Q: How long? A: 3 days; Q: Any imaging done? A: No"
        );
    }

    #[test]
    fn qa_section_empty_history_is_empty() {
        assert!(qa_section(&[]).is_empty());
    }

    #[test]
    fn retry_mode_parses_from_config_strings() {
        use std::str::FromStr;
        assert_eq!(
            RetryPromptMode::from_str("same").unwrap(),
            RetryPromptMode::Same
        );
        assert_eq!(
            RetryPromptMode::from_str("CORRECTIVE").unwrap(),
            RetryPromptMode::Corrective
        );
        assert!(RetryPromptMode::from_str("twice").is_err());
    }
}
