use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

use crate::patient::{format_number, PatientField, PatientProfile};

/// A trial expressed as typed thresholds. Any key left out is not checked.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StructuredTrial {
    pub name: String,
    #[serde(default)]
    pub inclusion_criteria: InclusionThresholds,
    #[serde(default)]
    pub exclusion_criteria: ExclusionThresholds,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InclusionThresholds {
    pub age_min: Option<f64>,
    pub ecog_max: Option<f64>,
    pub diagnosis: Option<Vec<String>>,
    pub staging: Option<Vec<String>>,
    pub prior_treatment: Option<Vec<String>>,
    pub measurable_disease: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExclusionThresholds {
    /// Most prior lines allowed. Accepts `2` or `">2"`.
    #[serde(deserialize_with = "line_limit")]
    pub prior_treatment_lines: Option<u32>,
    /// Substrings that exclude when found in the patient's comorbidities.
    pub comorbidities: Option<Vec<String>>,
}

fn line_limit<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Option::<Raw>::deserialize(d)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s
            .replace('>', "")
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid prior_treatment_lines: {:?}", s))),
    }
}

pub fn load_structured_trials(path: &Path) -> Result<Vec<StructuredTrial>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read trials from {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid trial JSON in {}", path.display()))
}

fn contains_ignore_case(options: &[String], value: &str) -> bool {
    let value = value.trim();
    options.iter().any(|o| o.trim().eq_ignore_ascii_case(value))
}

fn missing(field: PatientField) -> String {
    format!("{} not recorded", field)
}

/// Check every constraint the trial declares. Returns one reason per
/// violated (or uncheckable) constraint; empty means eligible.
pub fn check(trial: &StructuredTrial, patient: &PatientProfile) -> Vec<String> {
    let mut reasons = Vec::new();
    let inc = &trial.inclusion_criteria;
    let exc = &trial.exclusion_criteria;

    if let Some(min) = inc.age_min {
        match patient.number(PatientField::Age) {
            Some(age) if age < min => reasons.push(format!(
                "Age {} < minimum {}",
                format_number(age),
                format_number(min)
            )),
            Some(_) => {}
            None => reasons.push(missing(PatientField::Age)),
        }
    }

    if let Some(max) = inc.ecog_max {
        match patient.number(PatientField::EcogPerformanceStatus) {
            Some(ecog) if ecog > max => reasons.push(format!(
                "ECOG {} > maximum {}",
                format_number(ecog),
                format_number(max)
            )),
            Some(_) => {}
            None => reasons.push(missing(PatientField::EcogPerformanceStatus)),
        }
    }

    if let Some(allowed) = &inc.diagnosis {
        match patient.get(PatientField::Diagnosis).map(ToString::to_string) {
            Some(d) if !contains_ignore_case(allowed, &d) => {
                reasons.push(format!("Diagnosis {} not in [{}]", d, allowed.join(", ")))
            }
            Some(_) => {}
            None => reasons.push(missing(PatientField::Diagnosis)),
        }
    }

    if let Some(allowed) = &inc.staging {
        match patient.get(PatientField::Stage).map(ToString::to_string) {
            Some(s) if !contains_ignore_case(allowed, &s) => {
                reasons.push(format!("Stage {} not eligible", s))
            }
            Some(_) => {}
            None => reasons.push(missing(PatientField::Stage)),
        }
    }

    if let Some(allowed) = &inc.prior_treatment {
        match patient.get(PatientField::TreatmentHistory).map(ToString::to_string) {
            Some(t) if !contains_ignore_case(allowed, &t) => {
                reasons.push(format!("Treatment history '{}' not eligible", t))
            }
            Some(_) => {}
            None => reasons.push(missing(PatientField::TreatmentHistory)),
        }
    }

    if inc.measurable_disease == Some(true)
        && patient.flag(PatientField::MeasurableDisease) != Some(true)
    {
        reasons.push("Measurable disease required for trial".to_string());
    }

    if let Some(max_lines) = exc.prior_treatment_lines {
        match patient.number(PatientField::PriorTreatmentLines) {
            Some(lines) if lines > f64::from(max_lines) => {
                reasons.push(format!("More than {} prior lines of treatment", max_lines))
            }
            Some(_) => {}
            None => reasons.push(missing(PatientField::PriorTreatmentLines)),
        }
    }

    if let Some(conditions) = &exc.comorbidities {
        let history = patient
            .text(PatientField::Comorbidities)
            .unwrap_or_default()
            .to_lowercase();
        for condition in conditions {
            if !condition.trim().is_empty() && history.contains(&condition.to_lowercase()) {
                reasons.push(format!("Excluded due to comorbidity: {}", condition));
            }
        }
    }

    reasons
}
