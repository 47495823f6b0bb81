use serde::Serialize;

use crate::priority::ExclusionCount;

/// No link / no criteria available.
pub const NOT_AVAILABLE: &str = "n/a";
/// Registry lookup failed. Kept distinct from `n/a` on purpose.
pub const ERROR_SENTINEL: &str = "Error";

pub const SECTION_SEPARATOR: &str = "--------------------------------------------------";

pub const DETAILED_INFO_KEY: &str = "More Detailed Information:";
pub const PARTICIPATION_KEY: &str = "Participation Criteria Link:";
pub const ELIGIBILITY_KEY: &str = "Eligibility Criteria:";

pub const UNKNOWN_TRIAL: &str = "Unknown_Trial";

/// One scraped or registry-sourced trial, ready to persist as a row file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    pub registry_id: Option<String>,
    /// Filesystem-safe name used as the row file stem.
    pub storage_key: String,
    /// Rows in page order, separators included, trailing rows excluded.
    pub rows: Vec<Vec<String>>,
    pub detailed_info_link: String,
    pub participation_link: String,
    pub eligibility_text: String,
}

impl TrialRecord {
    /// Every row as persisted: the scraped rows followed by the three
    /// trailing rows the document parser keys on.
    pub fn to_rows(&self) -> Vec<Vec<String>> {
        let mut rows = self.rows.clone();
        rows.push(vec![DETAILED_INFO_KEY.into(), self.detailed_info_link.clone()]);
        rows.push(vec![PARTICIPATION_KEY.into(), self.participation_link.clone()]);
        rows.push(vec![ELIGIBILITY_KEY.into(), self.eligibility_text.clone()]);
        rows
    }

    /// Display name from the first `Name:` row.
    pub fn display_name(&self) -> Option<&str> {
        self.rows
            .iter()
            .find(|r| r.first().is_some_and(|c| c.trim_start().starts_with("Name:")))
            .and_then(|r| r.get(1))
            .map(String::as_str)
    }

    pub fn exclusion_count(&self) -> ExclusionCount {
        ExclusionCount::of(&self.eligibility_text)
    }
}

/// Alphanumerics and hyphens survive, everything else becomes `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// True for the placeholder values that carry no eligibility content.
pub fn is_sentinel(text: &str) -> bool {
    let t = text.trim();
    t.is_empty()
        || t.eq_ignore_ascii_case(NOT_AVAILABLE)
        || t.eq_ignore_ascii_case("na")
        || t.eq_ignore_ascii_case(ERROR_SENTINEL)
}
