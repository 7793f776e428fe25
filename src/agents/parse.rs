//! Lenient parsing of model output into typed payloads.
//!
//! Models are asked for JSON but routinely wrap it in prose or code
//! fences, or skip it entirely. Parsing tries three layers: direct JSON,
//! the first JSON object embedded in the text, then pattern-based
//! extraction of codes and questions. Only when all three come up empty
//! does the attempt count as a parse failure.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;

use crate::models::{CptCode, IcdCode};

static JSON_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

/// ICD-10 code shape: letter, two digits, optional decimal suffix.
static ICD_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]\d{2}(?:\.\d{1,3})?)\b").expect("valid regex"));

/// CPT codes are five-digit numbers.
static CPT_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{5})\b").expect("valid regex"));

static QUESTION_LABELED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)question[:\s]*([^?\n]+\?)").expect("valid regex"));

static QUESTION_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:can you|could you|do you|are you|have you|how|what)[^?\n]+\?")
        .expect("valid regex")
});

/// Extract a JSON value from model output: direct parse first, then the
/// first `{...}` block embedded in surrounding prose or code fences.
pub fn extract_json_value(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let block = JSON_BLOCK.find(trimmed)?;
    serde_json::from_str(block.as_str()).ok()
}

/// Deserialize an array field leniently — missing field is empty, items
/// that fail to deserialize are skipped.
pub fn lenient_array<T: DeserializeOwned>(value: Option<&serde_json::Value>) -> Vec<T> {
    match value.and_then(|v| v.as_array()) {
        None => vec![],
        Some(items) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
    }
}

/// Pull ICD-10 codes out of free text, pairing each with whatever
/// description trails it. Capped at 5, ranked in order of appearance.
pub fn icd_codes_from_text(text: &str) -> Vec<IcdCode> {
    let mut codes = Vec::new();
    for (rank, capture) in ICD_CODE.captures_iter(text).take(5).enumerate() {
        let code = capture[1].to_string();
        codes.push(IcdCode {
            description: trailing_description(text, &code)
                .unwrap_or_else(|| "Medical condition".to_string()),
            code,
            importance: rank as u32 + 1,
        });
    }
    codes
}

/// Pull CPT codes out of free text. Capped at 3.
pub fn cpt_codes_from_text(text: &str) -> Vec<CptCode> {
    let mut codes = Vec::new();
    for (rank, capture) in CPT_CODE.captures_iter(text).take(3).enumerate() {
        let code = capture[1].to_string();
        codes.push(CptCode {
            description: trailing_description(text, &code)
                .unwrap_or_else(|| "Medical procedure".to_string()),
            code,
            importance: rank as u32 + 1,
        });
    }
    codes
}

/// Description text immediately following a code, up to the next comma,
/// period, or newline.
fn trailing_description(text: &str, code: &str) -> Option<String> {
    let pattern = format!(r#"(?i){}["']?[:\s]+([^,\n\."']+)"#, regex::escape(code));
    let re = Regex::new(&pattern).ok()?;
    let capture = re.captures(text)?;
    let description = capture[1].trim();
    if description.is_empty() {
        None
    } else {
        Some(description.to_string())
    }
}

/// Pull the first clarifying question out of free text, if any.
pub fn questions_from_text(text: &str) -> Vec<String> {
    let mut questions: Vec<String> = Vec::new();

    for capture in QUESTION_LABELED.captures_iter(text) {
        push_question(&mut questions, capture[1].trim());
    }
    for found in QUESTION_PHRASE.find_iter(text) {
        push_question(&mut questions, found.as_str().trim());
    }

    questions.truncate(1);
    questions
}

fn push_question(questions: &mut Vec<String>, candidate: &str) {
    if candidate.len() > 10 && !questions.iter().any(|q| q == candidate) {
        questions.push(candidate.to_string());
    }
}

/// Find an explanation-like sentence in free text.
pub fn explanation_from_text(text: &str) -> Option<String> {
    const KEYWORDS: [&str; 8] = [
        "procedure",
        "recommended",
        "evaluation",
        "assessment",
        "monitoring",
        "treatment",
        "diagnosis",
        "care",
    ];

    for sentence in text.split('.') {
        let sentence = sentence.trim();
        if sentence.len() > 20 {
            let lowered = sentence.to_lowercase();
            if KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
                return Some(format!("{sentence}."));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── JSON extraction ──

    #[test]
    fn extracts_direct_json() {
        let value = extract_json_value(r#"{"icd_codes": []}"#).unwrap();
        assert!(value["icd_codes"].is_array());
    }

    #[test]
    fn extracts_json_embedded_in_prose() {
        let text = "Here are the codes you asked for:\n{\"icd_codes\": [{\"code\": \"R51\", \"description\": \"Headache\", \"importance\": 1}]}\nHope that helps!";
        let value = extract_json_value(text).unwrap();
        assert_eq!(value["icd_codes"][0]["code"], "R51");
    }

    #[test]
    fn extracts_json_from_code_fence() {
        let text = "```json\n{\"symptoms\": [\"headache\"], \"pregnancy_related\": false}\n```";
        let value = extract_json_value(text).unwrap();
        assert_eq!(value["symptoms"][0], "headache");
    }

    #[test]
    fn no_json_returns_none() {
        assert!(extract_json_value("The patient likely has a headache.").is_none());
    }

    #[test]
    fn lenient_array_skips_bad_items() {
        let value: serde_json::Value = serde_json::json!({
            "icd_codes": [
                {"code": "R51", "description": "Headache", "importance": 1},
                {"bogus": true},
                {"code": "G43.0", "description": "Migraine", "importance": 2}
            ]
        });
        let codes: Vec<IcdCode> = lenient_array(value.get("icd_codes"));
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[1].code, "G43.0");
    }

    // ── Pattern fallbacks ──

    #[test]
    fn icd_codes_from_prose() {
        let text = "Likely R51: Headache, consider G43.909: Migraine unspecified.";
        let codes = icd_codes_from_text(text);
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0].code, "R51");
        assert_eq!(codes[0].description, "Headache");
        assert_eq!(codes[0].importance, 1);
        assert_eq!(codes[1].code, "G43.909");
        assert_eq!(codes[1].importance, 2);
    }

    #[test]
    fn icd_codes_capped_at_five() {
        let text = "A01 B02 C03 D04 E05 F06 G07";
        assert_eq!(icd_codes_from_text(text).len(), 5);
    }

    #[test]
    fn no_icd_codes_in_plain_text() {
        assert!(icd_codes_from_text("rest and fluids should help").is_empty());
    }

    #[test]
    fn cpt_codes_from_prose() {
        let text = "Recommend 99214: Office visit and 36415: Blood draw.";
        let codes = cpt_codes_from_text(text);
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0].code, "99214");
        assert_eq!(codes[0].description, "Office visit");
    }

    #[test]
    fn cpt_codes_capped_at_three() {
        let text = "11111 22222 33333 44444";
        assert_eq!(cpt_codes_from_text(text).len(), 3);
    }

    #[test]
    fn missing_description_gets_placeholder() {
        let codes = icd_codes_from_text("Codes: R51");
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].description, "Medical condition");
    }

    // ── Questions ──

    #[test]
    fn labeled_question_extracted() {
        let text = "Question: How many weeks pregnant are you?";
        let questions = questions_from_text(text);
        assert_eq!(questions, vec!["How many weeks pregnant are you?"]);
    }

    #[test]
    fn phrase_question_extracted() {
        let text = "Before coding this, have you experienced any visual disturbances?";
        let questions = questions_from_text(text);
        assert_eq!(questions.len(), 1);
        assert!(questions[0].ends_with('?'));
    }

    #[test]
    fn at_most_one_question_returned() {
        let text = "Question: First thing? Question: Second thing entirely?";
        assert_eq!(questions_from_text(text).len(), 1);
    }

    #[test]
    fn short_fragments_are_not_questions() {
        assert!(questions_from_text("What now?").is_empty());
    }

    // ── Explanation ──

    #[test]
    fn explanation_sentence_found() {
        let text = "Blood work first. An office evaluation is recommended to rule out secondary causes. Follow up later.";
        let explanation = explanation_from_text(text).unwrap();
        assert!(explanation.contains("evaluation"));
        assert!(explanation.ends_with('.'));
    }

    #[test]
    fn no_explanation_in_unrelated_text() {
        assert!(explanation_from_text("Short. Words. Only.").is_none());
    }
}
