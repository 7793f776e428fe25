//! Intake stage — distills the patient narrative into a structured
//! symptom report. Served by the remote backend.

use std::sync::Arc;

use super::{generate_parsed, parse, AgentError, RetryPromptMode};
use crate::models::{PatientData, StageName, SymptomReport};
use crate::providers::{CapabilityProvider, GenerateParams};

pub struct SymptomAgent {
    provider: Arc<dyn CapabilityProvider>,
    model: String,
    retry_mode: RetryPromptMode,
}

impl SymptomAgent {
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

    /// Extract a symptom report from the narrative.
    pub async fn process(
        &self,
        narrative: &str,
        patient: Option<&PatientData>,
    ) -> Result<SymptomReport, AgentError> {
        let prompt = build_prompt(narrative, patient);
        generate_parsed(
            self.provider.as_ref(),
            StageName::Intake,
            &self.model,
            &prompt,
            &GenerateParams {
                max_tokens: Some(500),
                temperature: 0.1,
            },
            self.retry_mode,
            parse_report,
        )
        .await
    }

    /// Streaming variant: the symptom list is naturally incremental, so
    /// the report is delivered as progressive snapshots, the last of
    /// which is the complete result.
    pub async fn stream_process(
        &self,
        narrative: &str,
        patient: Option<&PatientData>,
    ) -> Result<Vec<SymptomReport>, AgentError> {
        let report = self.process(narrative, patient).await?;
        Ok(progressive_snapshots(report))
    }
}

fn build_prompt(narrative: &str, patient: Option<&PatientData>) -> String {
    let mut prompt = String::from(
        "Extract symptoms from the patient input. Return JSON with a \
         \"symptoms\" array of short symptom phrases and a \
         \"pregnancy_related\" boolean.",
    );
    if let Some(context) = patient_context(patient) {
        prompt.push_str("\n\nPatient: ");
        prompt.push_str(&context);
    }
    prompt.push_str("\n\nInput: ");
    prompt.push_str(narrative);
    prompt
}

fn patient_context(patient: Option<&PatientData>) -> Option<String> {
    let patient = patient?;
    let mut parts = Vec::new();
    if let Some(age) = patient.age {
        parts.push(format!("age {age}"));
    }
    if let Some(gender) = &patient.gender {
        parts.push(format!("gender {gender}"));
    }
    if patient.pregnant {
        match patient.weeks_pregnant {
            Some(weeks) => parts.push(format!("{weeks} weeks pregnant")),
            None => parts.push("pregnant".to_string()),
        }
    }
    if let Some(location) = &patient.location {
        parts.push(format!("located in {location}"));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

fn parse_report(text: &str) -> Result<SymptomReport, String> {
    let value =
        parse::extract_json_value(text).ok_or_else(|| "no JSON object in output".to_string())?;
    serde_json::from_value(value).map_err(|e| format!("symptom report shape mismatch: {e}"))
}

/// Progressive snapshots of a report: one per symptom, ending with the
/// full report.
fn progressive_snapshots(report: SymptomReport) -> Vec<SymptomReport> {
    if report.symptoms.is_empty() {
        return vec![report];
    }
    let mut snapshots = Vec::with_capacity(report.symptoms.len());
    for i in 1..=report.symptoms.len() {
        snapshots.push(SymptomReport {
            symptoms: report.symptoms[..i].to_vec(),
            pregnancy_related: report.pregnancy_related,
        });
    }
    snapshots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;

    fn agent(provider: Arc<MockProvider>) -> SymptomAgent {
        SymptomAgent::new(provider, "gpt-5-nano", RetryPromptMode::Corrective)
    }

    #[tokio::test]
    async fn parses_well_formed_report() {
        let provider = Arc::new(MockProvider::new(
            r#"{"symptoms": ["severe headache", "3 day duration"], "pregnancy_related": false}"#,
        ));
        let report = agent(provider)
            .process("severe headache for 3 days", None)
            .await
            .unwrap();
        assert_eq!(report.symptoms.len(), 2);
        assert!(!report.pregnancy_related);
    }

    #[tokio::test]
    async fn prompt_includes_patient_context() {
        let provider = Arc::new(MockProvider::new(
            r#"{"symptoms": ["headache"], "pregnancy_related": false}"#,
        ));
        let patient = PatientData {
            age: Some(35),
            gender: Some("Female".into()),
            ..Default::default()
        };
        agent(Arc::clone(&provider))
            .process("headache", Some(&patient))
            .await
            .unwrap();

        let prompts = provider.prompts();
        let prompt = &prompts[0];
        assert!(prompt.contains("age 35"));
        assert!(prompt.contains("gender Female"));
        assert!(prompt.contains("Input: headache"));
    }

    #[tokio::test]
    async fn unparseable_output_fails_after_retry() {
        let provider = Arc::new(MockProvider::new("I think it's a headache."));
        let err = agent(Arc::clone(&provider))
            .process("headache", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::Parse {
                stage: StageName::Intake,
                ..
            }
        ));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn stream_process_yields_growing_snapshots() {
        let provider = Arc::new(MockProvider::new(
            r#"{"symptoms": ["headache", "nausea", "photophobia"], "pregnancy_related": false}"#,
        ));
        let snapshots = agent(provider)
            .stream_process("headache with nausea", None)
            .await
            .unwrap();

        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].symptoms, vec!["headache"]);
        assert_eq!(snapshots[1].symptoms.len(), 2);
        assert_eq!(snapshots[2].symptoms.len(), 3);
    }

    #[test]
    fn empty_report_yields_single_snapshot() {
        let snapshots = progressive_snapshots(SymptomReport {
            symptoms: vec![],
            pregnancy_related: true,
        });
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].pregnancy_related);
    }

    #[test]
    fn pregnant_patient_context_mentions_weeks() {
        let patient = PatientData {
            pregnant: true,
            weeks_pregnant: Some(28),
            ..Default::default()
        };
        let context = patient_context(Some(&patient)).unwrap();
        assert_eq!(context, "28 weeks pregnant");
    }
}
