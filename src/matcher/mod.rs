//! Patient-to-trial eligibility.
//!
//! A trial is an [`EligibilityRule`] in one of two shapes. A `Structured`
//! trial carries typed thresholds and is checked axis by axis. A
//! `TextualHeuristic` trial carries only criterion sentences and is checked by
//! keyword association and fuzzy matching against its exclusion list. Per-trial
//! verdicts reduce to a three-way [`AggregateLabel`].

pub mod keyword;
pub mod strict;

use std::fmt;

use serde::Serialize;

use crate::document::TrialDocument;
use crate::patient::PatientProfile;

pub use keyword::{CriterionMatch, TextualTrial};
pub use strict::{load_structured_trials, ExclusionThresholds, InclusionThresholds, StructuredTrial};

pub const UNNAMED_TRIAL: &str = "Unnamed Trial";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Eligible,
    #[serde(rename = "Not Eligible")]
    NotEligible,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Eligible => "Eligible",
            Verdict::NotEligible => "Not Eligible",
        })
    }
}

/// Outcome for one (patient, trial) pair. Strict rules fill `reasons`; the
/// keyword engine fills `matches` and a one-line rationale in `reasons`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchVerdict {
    pub trial: String,
    pub verdict: Verdict,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<CriterionMatch>,
}

impl MatchVerdict {
    pub fn is_eligible(&self) -> bool {
        self.verdict == Verdict::Eligible
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EligibilityRule {
    Structured(StructuredTrial),
    TextualHeuristic(TextualTrial),
}

impl EligibilityRule {
    /// A parsed row file becomes a textual rule.
    pub fn from_document(doc: &TrialDocument) -> Self {
        EligibilityRule::TextualHeuristic(TextualTrial {
            name: doc.name().unwrap_or(UNNAMED_TRIAL).to_string(),
            criteria: doc.criteria.clone(),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            EligibilityRule::Structured(t) => &t.name,
            EligibilityRule::TextualHeuristic(t) => &t.name,
        }
    }

    pub fn evaluate(&self, patient: &PatientProfile) -> MatchVerdict {
        match self {
            EligibilityRule::Structured(trial) => {
                let reasons = strict::check(trial, patient);
                let verdict = if reasons.is_empty() {
                    Verdict::Eligible
                } else {
                    Verdict::NotEligible
                };
                MatchVerdict {
                    trial: trial.name.clone(),
                    verdict,
                    reasons,
                    matches: Vec::new(),
                }
            }
            // Inclusion criteria are not scored here; an exclusion hit decides.
            EligibilityRule::TextualHeuristic(trial) => {
                let matches = keyword::exclusion_matches(patient, &trial.criteria.exclusion);
                let (verdict, reasons) = match matches.as_slice() {
                    [] => (
                        Verdict::Eligible,
                        vec!["No exclusion criterion matched the patient profile".to_string()],
                    ),
                    hits => (
                        Verdict::NotEligible,
                        hits.iter()
                            .map(|m| format!("{} '{}' matches exclusion: {}", m.field, m.value, m.criterion))
                            .collect(),
                    ),
                };
                MatchVerdict {
                    trial: trial.name.clone(),
                    verdict,
                    reasons,
                    matches,
                }
            }
        }
    }
}

impl From<StructuredTrial> for EligibilityRule {
    fn from(t: StructuredTrial) -> Self {
        EligibilityRule::Structured(t)
    }
}

impl From<TextualTrial> for EligibilityRule {
    fn from(t: TextualTrial) -> Self {
        EligibilityRule::TextualHeuristic(t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AggregateLabel {
    #[serde(rename = "Not Eligible")]
    NotEligible,
    #[serde(rename = "Eligible for Some")]
    EligibleForSome,
    #[serde(rename = "Eligible for Most")]
    EligibleForMost,
}

impl AggregateLabel {
    /// Zero eligible (or zero evaluated) is `NotEligible`; fewer than half
    /// is `EligibleForSome`; half or more is `EligibleForMost`.
    pub fn from_counts(eligible: usize, total: usize) -> Self {
        if eligible == 0 || total == 0 {
            AggregateLabel::NotEligible
        } else if 2 * eligible < total {
            AggregateLabel::EligibleForSome
        } else {
            AggregateLabel::EligibleForMost
        }
    }
}

impl fmt::Display for AggregateLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggregateLabel::NotEligible => "Not Eligible",
            AggregateLabel::EligibleForSome => "Eligible for Some",
            AggregateLabel::EligibleForMost => "Eligible for Most",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub label: AggregateLabel,
    pub eligible: usize,
    pub evaluated: usize,
    pub verdicts: Vec<MatchVerdict>,
}

pub fn aggregate(verdicts: Vec<MatchVerdict>) -> Classification {
    let eligible = verdicts.iter().filter(|v| v.is_eligible()).count();
    let evaluated = verdicts.len();
    Classification {
        label: AggregateLabel::from_counts(eligible, evaluated),
        eligible,
        evaluated,
        verdicts,
    }
}

pub fn classify(patient: &PatientProfile, rules: &[EligibilityRule]) -> Classification {
    aggregate(rules.iter().map(|r| r.evaluate(patient)).collect())
}
