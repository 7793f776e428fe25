//! Summary stage — composes the whole consultation into a short
//! patient-facing narrative. Served by the remote backend.

use std::sync::Arc;

use super::{generate_parsed, AgentError, RetryPromptMode};
use crate::models::{
    CptAssessment, IcdAssessment, ProviderMatch, StageName, SymptomReport,
};
use crate::providers::{CapabilityProvider, GenerateParams};

pub struct SummaryAgent {
    provider: Arc<dyn CapabilityProvider>,
    model: String,
    retry_mode: RetryPromptMode,
}

impl SummaryAgent {
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
        icd: &IcdAssessment,
        cpt: &CptAssessment,
        providers: &[ProviderMatch],
    ) -> Result<String, AgentError> {
        let prompt = build_prompt(symptoms, icd, cpt, providers);
        generate_parsed(
            self.provider.as_ref(),
            StageName::Summary,
            &self.model,
            &prompt,
            &GenerateParams {
                max_tokens: Some(300),
                temperature: 0.3,
            },
            self.retry_mode,
            |text| {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    Err("empty summary".to_string())
                } else {
                    Ok(trimmed.to_string())
                }
            },
        )
        .await
    }
}

fn build_prompt(
    symptoms: &SymptomReport,
    icd: &IcdAssessment,
    cpt: &CptAssessment,
    providers: &[ProviderMatch],
) -> String {
    let diagnoses: Vec<String> = icd
        .icd_codes
        .iter()
        .map(|c| format!("{} ({})", c.description, c.code))
        .collect();
    let procedures: Vec<String> = cpt
        .cpt_codes
        .iter()
        .map(|c| format!("{} ({})", c.description, c.code))
        .collect();
    let recommended: Vec<String> = providers
        .iter()
        .map(|p| format!("{} — {}", p.name, p.specialty))
        .collect();

    format!(
        r#"Summarize this consultation for the patient in plain language.

SYMPTOMS: {}
LIKELY DIAGNOSES: {}
RECOMMENDED PROCEDURES: {}
RECOMMENDED PROVIDERS: {}

Cover what was found, what to do next, and who to see. Do not invent findings.
4 sentences maximum, no medical jargon without a plain-language gloss."#,
        symptoms.symptoms.join(", "),
        diagnoses.join("; "),
        procedures.join("; "),
        recommended.join("; "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CptCode, IcdCode};
    use crate::providers::MockProvider;

    fn inputs() -> (SymptomReport, IcdAssessment, CptAssessment, Vec<ProviderMatch>) {
        (
            SymptomReport {
                symptoms: vec!["severe headache".into(), "3 day duration".into()],
                pregnancy_related: false,
            },
            IcdAssessment {
                icd_codes: vec![IcdCode {
                    code: "R51".into(),
                    description: "Headache".into(),
                    importance: 1,
                }],
                questions: vec![],
            },
            CptAssessment {
                cpt_codes: vec![CptCode {
                    code: "99214".into(),
                    description: "Office visit".into(),
                    importance: 1,
                }],
                explanation: "Evaluation recommended.".into(),
                questions: vec![],
            },
            vec![ProviderMatch {
                name: "Boston Medical Center Internal Medicine".into(),
                specialty: "Internal Medicine".into(),
                hospital: "Boston Medical".into(),
                rating: 4.7,
                match_score: 6.2,
                explanation: None,
            }],
        )
    }

    #[tokio::test]
    async fn summary_returns_trimmed_text() {
        let provider = Arc::new(MockProvider::new(
            "  Your headache pattern points to a tension headache. See internal medicine this week.  ",
        ));
        let agent = SummaryAgent::new(provider, "gpt-5-nano", RetryPromptMode::Corrective);
        let (symptoms, icd, cpt, providers) = inputs();
        let summary = agent
            .process(&symptoms, &icd, &cpt, &providers)
            .await
            .unwrap();
        assert!(summary.starts_with("Your headache"));
        assert!(summary.ends_with("week."));
    }

    #[tokio::test]
    async fn prompt_carries_all_prior_stage_results() {
        let provider = Arc::new(MockProvider::new("Summary text."));
        let agent = SummaryAgent::new(Arc::clone(&provider) as Arc<dyn CapabilityProvider>, "gpt-5-nano", RetryPromptMode::Corrective);
        let (symptoms, icd, cpt, providers) = inputs();
        agent
            .process(&symptoms, &icd, &cpt, &providers)
            .await
            .unwrap();

        let prompts = provider.prompts();
        let prompt = &prompts[0];
        assert!(prompt.contains("severe headache"));
        assert!(prompt.contains("Headache (R51)"));
        assert!(prompt.contains("Office visit (99214)"));
        assert!(prompt.contains("Boston Medical Center Internal Medicine — Internal Medicine"));
    }

    #[tokio::test]
    async fn empty_summary_fails_after_retry() {
        let provider = Arc::new(MockProvider::new(""));
        let agent = SummaryAgent::new(Arc::clone(&provider) as Arc<dyn CapabilityProvider>, "gpt-5-nano", RetryPromptMode::Corrective);
        let (symptoms, icd, cpt, providers) = inputs();
        let err = agent
            .process(&symptoms, &icd, &cpt, &providers)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::Parse {
                stage: StageName::Summary,
                ..
            }
        ));
        assert_eq!(provider.call_count(), 2);
    }
}
