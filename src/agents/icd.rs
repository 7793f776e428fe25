//! ICD stage — diagnostic coding from the symptom report. Served by the
//! local backend. May ask one clarifying question, which pauses the
//! pipeline in AwaitingAnswer.

use std::sync::Arc;

use super::{generate_parsed, parse, qa_section, AgentError, QaExchange, RetryPromptMode};
use crate::models::{IcdAssessment, StageName, SymptomReport};
use crate::providers::{CapabilityProvider, GenerateParams};

pub struct IcdAgent {
    provider: Arc<dyn CapabilityProvider>,
    model: String,
    retry_mode: RetryPromptMode,
}

impl IcdAgent {
    pub fn new(
        provider: Arc<dyn CapabilityProvider>,
        model: &str,
        retry_mode: RetryPromptMode,
    ) -> Self {
        Self {
            provider,
            model: model.to_string(),
            retry_mode,
        }
    }

    pub async fn warmup(&self) {
        self.provider.warmup(&self.model).await;
    }

    pub async fn process(
        &self,
        symptoms: &SymptomReport,
        qa_history: &[QaExchange],
    ) -> Result<IcdAssessment, AgentError> {
        let prompt = build_prompt(symptoms, qa_history);
        generate_parsed(
            self.provider.as_ref(),
            StageName::Icd,
            &self.model,
            &prompt,
            &GenerateParams::deterministic(1000),
            self.retry_mode,
            parse_assessment,
        )
        .await
    }
}

fn build_prompt(symptoms: &SymptomReport, qa_history: &[QaExchange]) -> String {
    let symptoms_json =
        serde_json::to_string(symptoms).unwrap_or_else(|_| symptoms.symptoms.join(", "));
    let qa = qa_section(qa_history);

    format!(
        r#"You are a medical coder. Generate ICD-10 codes for these symptoms.

SYMPTOMS: {symptoms_json}
{qa}

You may ask 1 clarifying question if critically needed.

Return valid JSON with importance ranking (1=most important, lower numbers = higher priority):
{{
    "icd_codes": [
        {{"code": "O14.0", "description": "Mild preeclampsia", "importance": 1}},
        {{"code": "R51", "description": "Headache", "importance": 2}}
    ],
    "questions": ["Question if needed"]
}}"#
    )
}

/// Parse the coder output. JSON first; pattern extraction as a fallback.
/// An output with neither codes nor a question is a parse failure.
fn parse_assessment(text: &str) -> Result<IcdAssessment, String> {
    if let Some(value) = parse::extract_json_value(text) {
        let icd_codes = parse::lenient_array(value.get("icd_codes"));
        let questions = parse::lenient_array(value.get("questions"));
        if !icd_codes.is_empty() || !questions.is_empty() {
            return Ok(IcdAssessment {
                icd_codes,
                questions,
            });
        }
    }

    let icd_codes = parse::icd_codes_from_text(text);
    let questions = parse::questions_from_text(text);
    if icd_codes.is_empty() && questions.is_empty() {
        return Err("no diagnostic codes or questions found".to_string());
    }
    Ok(IcdAssessment {
        icd_codes,
        questions,
    })
}
