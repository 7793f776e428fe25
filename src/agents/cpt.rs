//! CPT stage — procedure coding from symptoms plus the diagnostic codes.
//! Served by the local backend. May ask one clarifying question.

use std::sync::Arc;

use super::{generate_parsed, parse, qa_section, AgentError, QaExchange, RetryPromptMode};
use crate::models::{CptAssessment, IcdCode, StageName, SymptomReport};
use crate::providers::{CapabilityProvider, GenerateParams};

const FALLBACK_EXPLANATION: &str =
    "Standard evaluation and monitoring procedures recommended based on presented symptoms.";

pub struct CptAgent {
    provider: Arc<dyn CapabilityProvider>,
    model: String,
    retry_mode: RetryPromptMode,
}

impl CptAgent {
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
        icd_codes: &[IcdCode],
        qa_history: &[QaExchange],
    ) -> Result<CptAssessment, AgentError> {
        let prompt = build_prompt(symptoms, icd_codes, qa_history);
        generate_parsed(
            self.provider.as_ref(),
            StageName::Cpt,
            &self.model,
            &prompt,
            &GenerateParams::deterministic(1000),
            self.retry_mode,
            parse_assessment,
        )
        .await
    }
}

fn build_prompt(
    symptoms: &SymptomReport,
    icd_codes: &[IcdCode],
    qa_history: &[QaExchange],
) -> String {
    let symptoms_json =
        serde_json::to_string(symptoms).unwrap_or_else(|_| symptoms.symptoms.join(", "));
    let codes_json = serde_json::to_string(icd_codes).unwrap_or_default();
    let qa = qa_section(qa_history);

    format!(
        r#"You are a medical coder. Generate 2-3 most relevant CPT procedure codes based on symptoms and diagnosis codes.

SYMPTOMS: {symptoms_json}
DIAGNOSIS CODES: {codes_json}
{qa}

Return valid JSON with 2-3 CPT codes maximum, importance ranking (1=most important), and brief explanation:
{{
    "cpt_codes": [
        {{"code": "99214", "description": "Office visit", "importance": 1}},
        {{"code": "36415", "description": "Blood draw", "importance": 2}}
    ],
    "explanation": "Brief explanation of procedures recommended for these symptoms",
    "questions": ["Question if needed"]
}}"#
    )
}

fn parse_assessment(text: &str) -> Result<CptAssessment, String> {
    if let Some(value) = parse::extract_json_value(text) {
        let cpt_codes = parse::lenient_array(value.get("cpt_codes"));
        let questions = parse::lenient_array(value.get("questions"));
        let explanation = value
            .get("explanation")
            .and_then(|e| e.as_str())
            .map(str::to_string);
        if !cpt_codes.is_empty() || !questions.is_empty() {
            return Ok(CptAssessment {
                cpt_codes,
                explanation: explanation.unwrap_or_else(|| FALLBACK_EXPLANATION.to_string()),
                questions,
            });
        }
    }

    let cpt_codes = parse::cpt_codes_from_text(text);
    let questions = parse::questions_from_text(text);
    if cpt_codes.is_empty() && questions.is_empty() {
        return Err("no procedure codes or questions found".to_string());
    }
    Ok(CptAssessment {
        cpt_codes,
        explanation: parse::explanation_from_text(text)
            .unwrap_or_else(|| FALLBACK_EXPLANATION.to_string()),
        questions,
    })
}
