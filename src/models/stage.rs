//! Pipeline stage domain types.
//!
//! A consultation moves through five stages in fixed order:
//! Intake → ICD → CPT → Doctor → Summary. Each completed stage produces
//! an immutable `StageResult` carrying a typed payload.

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════
// Stage identity and ordering
// ═══════════════════════════════════════════════════════════

/// One of the five pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Intake,
    Icd,
    Cpt,
    Doctor,
    Summary,
}

impl StageName {
    /// Pipeline order. Every subscriber observes results as a strict
    /// prefix of this sequence.
    pub const ORDER: [StageName; 5] = [
        StageName::Intake,
        StageName::Icd,
        StageName::Cpt,
        StageName::Doctor,
        StageName::Summary,
    ];

    /// The stage that runs after this one, if any.
    pub fn next(self) -> Option<StageName> {
        match self {
            StageName::Intake => Some(StageName::Icd),
            StageName::Icd => Some(StageName::Cpt),
            StageName::Cpt => Some(StageName::Doctor),
            StageName::Doctor => Some(StageName::Summary),
            StageName::Summary => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Intake => "intake",
            StageName::Icd => "icd",
            StageName::Cpt => "cpt",
            StageName::Doctor => "doctor",
            StageName::Summary => "summary",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a session currently sits in the pipeline.
///
/// `AwaitingAnswer` is a side state entered when a stage asks a
/// clarifying question; resuming returns to the stage it branched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePosition {
    Intake,
    Icd,
    Cpt,
    Doctor,
    Summary,
    AwaitingAnswer,
    Done,
    Failed,
}

impl From<StageName> for PipelinePosition {
    fn from(stage: StageName) -> Self {
        match stage {
            StageName::Intake => PipelinePosition::Intake,
            StageName::Icd => PipelinePosition::Icd,
            StageName::Cpt => PipelinePosition::Cpt,
            StageName::Doctor => PipelinePosition::Doctor,
            StageName::Summary => PipelinePosition::Summary,
        }
    }
}

impl PipelinePosition {
    /// Terminal positions accept no further pipeline work.
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelinePosition::Done | PipelinePosition::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelinePosition::Intake => "intake",
            PipelinePosition::Icd => "icd",
            PipelinePosition::Cpt => "cpt",
            PipelinePosition::Doctor => "doctor",
            PipelinePosition::Summary => "summary",
            PipelinePosition::AwaitingAnswer => "awaiting_answer",
            PipelinePosition::Done => "done",
            PipelinePosition::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelinePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single stage as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

// ═══════════════════════════════════════════════════════════
// Stage payloads
// ═══════════════════════════════════════════════════════════

/// Intake output: symptoms distilled from the patient narrative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymptomReport {
    pub symptoms: Vec<String>,
    #[serde(default)]
    pub pregnancy_related: bool,
}

/// One ICD-10 diagnostic code with its importance rank (1 = highest).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcdCode {
    pub code: String,
    pub description: String,
    #[serde(default = "default_importance")]
    pub importance: u32,
}

/// ICD stage output. A non-empty `questions` list routes the session
/// to AwaitingAnswer instead of completing the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcdAssessment {
    pub icd_codes: Vec<IcdCode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
}

/// One CPT procedure code with its importance rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CptCode {
    pub code: String,
    pub description: String,
    #[serde(default = "default_importance")]
    pub importance: u32,
}

/// CPT stage output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CptAssessment {
    pub cpt_codes: Vec<CptCode>,
    #[serde(default)]
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
}

fn default_importance() -> u32 {
    1
}

/// One matched healthcare provider with an optional model-written
/// explanation of the match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMatch {
    pub name: String,
    pub specialty: String,
    pub hospital: String,
    pub rating: f32,
    pub match_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Typed payload of one completed stage. Serialized untagged so each
/// stage's `result` field carries its natural JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StagePayload {
    Symptoms(SymptomReport),
    Icd(IcdAssessment),
    Cpt(CptAssessment),
    Providers(Vec<ProviderMatch>),
    Summary(String),
}

// ═══════════════════════════════════════════════════════════
// StageResult
// ═══════════════════════════════════════════════════════════

/// The immutable outcome of one pipeline stage. Appended to the
/// session's result list, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StagePayload>,
}

impl StageResult {
    pub fn completed(stage: StageName, payload: StagePayload) -> Self {
        Self {
            stage,
            status: StageStatus::Completed,
            message: None,
            payload: Some(payload),
        }
    }

    pub fn failed(stage: StageName, reason: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            message: Some(reason.into()),
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_the_five_stage_pipeline() {
        assert_eq!(StageName::ORDER.len(), 5);
        assert_eq!(StageName::ORDER[0], StageName::Intake);
        assert_eq!(StageName::ORDER[4], StageName::Summary);
    }

    #[test]
    fn next_walks_the_pipeline_in_order() {
        let mut stage = StageName::Intake;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen, StageName::ORDER);
    }

    #[test]
    fn summary_is_the_last_stage() {
        assert_eq!(StageName::Summary.next(), None);
    }

    #[test]
    fn positions_terminal_flags() {
        assert!(PipelinePosition::Done.is_terminal());
        assert!(PipelinePosition::Failed.is_terminal());
        assert!(!PipelinePosition::AwaitingAnswer.is_terminal());
        assert!(!PipelinePosition::Icd.is_terminal());
    }

    #[test]
    fn stage_name_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&StageName::Intake).unwrap(),
            "\"intake\""
        );
        assert_eq!(serde_json::to_string(&StageName::Icd).unwrap(), "\"icd\"");
    }

    #[test]
    fn icd_assessment_parses_model_output_shape() {
        let parsed: IcdAssessment = serde_json::from_str(
            r#"{
                "icd_codes": [
                    {"code": "R51", "description": "Headache", "importance": 2},
                    {"code": "O14.0", "description": "Mild preeclampsia", "importance": 1}
                ],
                "questions": ["How long have you had the headache?"]
            }"#,
        )
        .unwrap();
        assert_eq!(parsed.icd_codes.len(), 2);
        assert_eq!(parsed.icd_codes[0].code, "R51");
        assert_eq!(parsed.questions.len(), 1);
    }

    #[test]
    fn icd_assessment_questions_default_empty() {
        let parsed: IcdAssessment = serde_json::from_str(
            r#"{"icd_codes": [{"code": "R51", "description": "Headache"}]}"#,
        )
        .unwrap();
        assert!(parsed.questions.is_empty());
        assert_eq!(parsed.icd_codes[0].importance, 1);
    }

    #[test]
    fn empty_questions_omitted_on_the_wire() {
        let assessment = IcdAssessment {
            icd_codes: vec![],
            questions: vec![],
        };
        let json = serde_json::to_string(&assessment).unwrap();
        assert!(!json.contains("questions"));
    }

    #[test]
    fn stage_payload_serializes_untagged() {
        let payload = StagePayload::Symptoms(SymptomReport {
            symptoms: vec!["headache".into()],
            pregnancy_related: false,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["symptoms"][0], "headache");
        // No enum tag leaks into the wire shape
        assert!(json.get("Symptoms").is_none());

        let summary = StagePayload::Summary("All clear.".into());
        assert_eq!(serde_json::to_value(&summary).unwrap(), "All clear.");
    }

    #[test]
    fn completed_result_carries_payload() {
        let result = StageResult::completed(
            StageName::Summary,
            StagePayload::Summary("text".into()),
        );
        assert_eq!(result.status, StageStatus::Completed);
        assert!(result.payload.is_some());
        assert!(result.message.is_none());
    }

    #[test]
    fn failed_result_carries_reason_not_payload() {
        let result = StageResult::failed(StageName::Icd, "unparseable output");
        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.payload.is_none());
        assert_eq!(result.message.as_deref(), Some("unparseable output"));
    }
}
