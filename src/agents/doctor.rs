//! Doctor stage — matches healthcare providers to the diagnosis and has
//! the remote model write a short explanation for each match.
//!
//! Selection itself is deterministic: specialties are derived from the
//! ICD codes, then the provider directory is scored by specialty match
//! and rating. Only the explanations cost a model call.

use std::sync::Arc;

use super::{generate_parsed, AgentError, RetryPromptMode};
use crate::models::{IcdCode, ProviderMatch, StageName, SymptomReport};
use crate::providers::{CapabilityProvider, GenerateParams};

/// One entry of the static provider directory.
struct DirectoryEntry {
    name: &'static str,
    specialty: &'static str,
    hospital: &'static str,
    rating: f32,
}

const DIRECTORY: [DirectoryEntry; 10] = [
    DirectoryEntry { name: "Mass General Maternal-Fetal Medicine", specialty: "Maternal-Fetal Medicine", hospital: "Mass General", rating: 4.9 },
    DirectoryEntry { name: "Brigham Women's Obstetrics", specialty: "Obstetrics", hospital: "Brigham Women's", rating: 4.8 },
    DirectoryEntry { name: "Boston Medical Center Internal Medicine", specialty: "Internal Medicine", hospital: "Boston Medical", rating: 4.7 },
    DirectoryEntry { name: "Newton-Wellesley Family Medicine", specialty: "Family Medicine", hospital: "Newton-Wellesley", rating: 4.6 },
    DirectoryEntry { name: "Beth Israel Emergency Medicine", specialty: "Emergency Medicine", hospital: "Beth Israel", rating: 4.5 },
    DirectoryEntry { name: "Tufts Medical Cardiology", specialty: "Cardiology", hospital: "Tufts Medical", rating: 4.8 },
    DirectoryEntry { name: "Harvard Vanguard Primary Care", specialty: "Primary Care", hospital: "Harvard Vanguard", rating: 4.6 },
    DirectoryEntry { name: "Children's Hospital Pediatrics", specialty: "Pediatrics", hospital: "Children's Hospital", rating: 4.9 },
    DirectoryEntry { name: "McLean Hospital Psychiatry", specialty: "Psychiatry", hospital: "McLean Hospital", rating: 4.7 },
    DirectoryEntry { name: "Spaulding Rehabilitation", specialty: "Physical Medicine", hospital: "Spaulding", rating: 4.5 },
];

const GENERALIST_SPECIALTIES: [&str; 3] = ["Internal Medicine", "Family Medicine", "Primary Care"];

pub struct DoctorAgent {
    provider: Arc<dyn CapabilityProvider>,
    model: String,
    retry_mode: RetryPromptMode,
}

impl DoctorAgent {
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

    /// Score the directory against the diagnosis and return the top
    /// `count` matches, without explanations.
    pub fn select_providers(&self, icd_codes: &[IcdCode], count: usize) -> Vec<ProviderMatch> {
        select_providers(icd_codes, count)
    }

    /// Write the match explanation for one selected provider.
    pub async fn explain(
        &self,
        matched: &ProviderMatch,
        symptoms: &SymptomReport,
    ) -> Result<String, AgentError> {
        let prompt = explanation_prompt(matched, symptoms);
        generate_parsed(
            self.provider.as_ref(),
            StageName::Doctor,
            &self.model,
            &prompt,
            &GenerateParams {
                max_tokens: Some(150),
                temperature: 0.3,
            },
            self.retry_mode,
            |text| {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    Err("empty explanation".to_string())
                } else {
                    Ok(trimmed.to_string())
                }
            },
        )
        .await
    }

    /// Select and explain in one pass.
    pub async fn process(
        &self,
        icd_codes: &[IcdCode],
        symptoms: &SymptomReport,
        count: usize,
    ) -> Result<Vec<ProviderMatch>, AgentError> {
        let mut matches = self.select_providers(icd_codes, count);
        for matched in &mut matches {
            matched.explanation = Some(self.explain(matched, symptoms).await?);
        }
        Ok(matches)
    }

    /// Additional recommendations beyond the ones a consultation already
    /// produced.
    pub async fn more_providers(
        &self,
        icd_codes: &[IcdCode],
        already_recommended: &[String],
        symptoms: &SymptomReport,
        count: usize,
    ) -> Result<Vec<ProviderMatch>, AgentError> {
        let mut additional: Vec<ProviderMatch> =
            select_providers(icd_codes, DIRECTORY.len())
                .into_iter()
                .filter(|m| !already_recommended.contains(&m.name))
                .take(count)
                .collect();
        for matched in &mut additional {
            matched.explanation = Some(self.explain(matched, symptoms).await?);
        }
        Ok(additional)
    }
}

/// Specialties implied by a set of diagnostic codes.
fn specialties_for(icd_codes: &[IcdCode]) -> Vec<&'static str> {
    let mut specialties: Vec<&'static str> = Vec::new();
    for code in icd_codes {
        let desc = code.description.to_lowercase();
        let code_str = code.code.to_uppercase();

        if ["pregnancy", "obstetric", "preeclampsia", "maternal"]
            .iter()
            .any(|kw| desc.contains(kw))
        {
            specialties.extend(["Maternal-Fetal Medicine", "Obstetrics"]);
        } else if ["cardiac", "heart", "cardio"].iter().any(|kw| desc.contains(kw)) {
            specialties.push("Cardiology");
        } else if ["depression", "anxiety", "mental", "psychiatric"]
            .iter()
            .any(|kw| desc.contains(kw))
        {
            specialties.push("Psychiatry");
        } else if code_str.starts_with('P')
            || ["pediatric", "child", "infant"].iter().any(|kw| desc.contains(kw))
        {
            specialties.push("Pediatrics");
        } else if ["emergency", "acute", "trauma"].iter().any(|kw| desc.contains(kw)) {
            specialties.push("Emergency Medicine");
        } else if ["musculoskeletal", "fracture", "joint", "muscle"]
            .iter()
            .any(|kw| desc.contains(kw))
        {
            specialties.push("Physical Medicine");
        } else {
            specialties.extend(GENERALIST_SPECIALTIES);
        }
    }
    specialties
}

fn select_providers(icd_codes: &[IcdCode], count: usize) -> Vec<ProviderMatch> {
    let specialties = specialties_for(icd_codes);

    let mut scored: Vec<ProviderMatch> = DIRECTORY
        .iter()
        .map(|entry| {
            let mut score = entry.rating;
            if specialties.contains(&entry.specialty) {
                score += 1.0;
            }
            if GENERALIST_SPECIALTIES.contains(&entry.specialty) {
                score += 0.5;
            }
            ProviderMatch {
                name: entry.name.to_string(),
                specialty: entry.specialty.to_string(),
                hospital: entry.hospital.to_string(),
                rating: entry.rating,
                match_score: score,
                explanation: None,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.match_score
            .partial_cmp(&a.match_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(count);
    scored
}

fn explanation_prompt(matched: &ProviderMatch, symptoms: &SymptomReport) -> String {
    format!(
        r#"Explain why {} is the right choice for treating: {:?}

Write about the department's expertise with these specific symptoms. Focus on:
- What procedures/tests they perform for these symptoms
- Their specialized training and experience
- Why patients choose this department

Be direct and factual. No hedging language like "would" or "I cannot verify". 2 sentences maximum."#,
        matched.name, symptoms.symptoms
    )
}
