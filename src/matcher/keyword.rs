use serde::Serialize;

use crate::document::StructuredCriteria;
use crate::patient::{PatientField, PatientProfile};

/// Above this similarity a sentence matches even without verbatim containment.
pub const SIMILARITY_THRESHOLD: f64 = 0.9;

/// Keywords that tie a sentence to a patient field. Fields absent here are
/// never checked.
pub fn field_keywords(field: PatientField) -> &'static [&'static str] {
    match field {
        PatientField::EcogPerformanceStatus => &["ecog", "performance status"],
        PatientField::GeneticMutations => &["mutation", "brca", "tp53"],
        PatientField::Comorbidities => &["hypertension", "diabetes", "cardiac"],
        PatientField::OrganFunctionStatus => &["organ", "liver", "kidney", "renal"],
        PatientField::PreviousCancerHistory => &["previous cancer", "prior cancer"],
        PatientField::PresenceOfMetastases => &["metastatic", "stage iv", "metastases"],
        PatientField::PregnancyBreastfeedingStatus => &["pregnancy", "pregnant", "breastfeeding"],
        PatientField::Age => &["age", "years old"],
        PatientField::Diagnosis => &["diagnosis", "tumor", "carcinoma"],
        PatientField::Gender => &["female", "male"],
        PatientField::TreatmentHistory => &["chemotherapy", "radiotherapy", "treatment history"],
        _ => &[],
    }
}

/// Registry page boilerplate that ends up inside scraped exclusion lists.
pub const EXCLUSION_NOISE: [&str; 7] = [
    "ages eligible",
    "sexes eligible",
    "healthy volunteers",
    "show less",
    "sampling method",
    "study population",
    "gender eligibility",
];

/// Evidence that a patient field hit an exclusion sentence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriterionMatch {
    pub field: PatientField,
    pub value: String,
    pub criterion: String,
    pub similarity: f64,
}

/// A trial known only by its free-text criterion sentences.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TextualTrial {
    pub name: String,
    pub criteria: StructuredCriteria,
}

pub fn is_noise(sentence: &str) -> bool {
    let lower = sentence.to_lowercase();
    EXCLUSION_NOISE.iter().any(|p| lower.contains(p))
}

/// Scan exclusion sentences for each text-valued patient field. Per field
/// and sentence, the first keyword present decides: the sentence matches if
/// it contains the value or is close enough to it.
pub fn exclusion_matches(patient: &PatientProfile, exclusion: &[String]) -> Vec<CriterionMatch> {
    let cleaned: Vec<(&String, String)> = exclusion
        .iter()
        .filter(|s| !is_noise(s))
        .map(|s| (s, s.to_lowercase()))
        .collect();

    let mut matched = Vec::new();
    for (field, value) in patient.known() {
        let Some(value) = value.as_text().map(str::trim).filter(|v| !v.is_empty()) else {
            continue;
        };
        let keywords = field_keywords(field);
        if keywords.is_empty() {
            continue;
        }
        let value_lower = value.to_lowercase();

        for (sentence, sentence_lower) in &cleaned {
            if !keywords.iter().any(|k| sentence_lower.contains(k)) {
                continue;
            }
            let similarity = strsim::normalized_levenshtein(&value_lower, sentence_lower);
            if sentence_lower.contains(&value_lower) || similarity > SIMILARITY_THRESHOLD {
                matched.push(CriterionMatch {
                    field,
                    value: value.to_string(),
                    criterion: (*sentence).clone(),
                    similarity,
                });
            }
        }
    }
    matched
}
