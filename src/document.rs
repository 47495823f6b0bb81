use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::error::StoreError;
use crate::record::{DETAILED_INFO_KEY, ELIGIBILITY_KEY};
use crate::store::read_row_file;

static SEPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-{50,}").unwrap());
static KEY_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([^,:]+):,(.*)$").unwrap());
static SENTENCE_END_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.(?:\s+|$)").unwrap());

const CRITERIA_SPLIT: &str = "||";

/// Inclusion and exclusion criteria as sentence lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StructuredCriteria {
    pub inclusion: Vec<String>,
    pub exclusion: Vec<String>,
}

impl StructuredCriteria {
    /// Split on `||` into inclusion/exclusion halves, then into sentences.
    /// Without the delimiter everything is inclusion.
    pub fn from_eligibility_text(text: &str) -> Self {
        let text = text.trim();
        let text = text
            .strip_prefix(ELIGIBILITY_KEY)
            .map(str::trim_start)
            .unwrap_or(text);
        let (inclusion, exclusion) = text.split_once(CRITERIA_SPLIT).unwrap_or((text, ""));

        StructuredCriteria {
            inclusion: split_sentences(strip_label(inclusion, "Inclusion:")),
            exclusion: split_sentences(strip_label(exclusion, "Exclusion:")),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inclusion.is_empty() && self.exclusion.is_empty()
    }
}

fn strip_label<'a>(half: &'a str, label: &str) -> &'a str {
    let half = half.trim();
    half.strip_prefix(label).unwrap_or(half).trim()
}

pub fn split_sentences(text: &str) -> Vec<String> {
    SENTENCE_END_RE
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// A row file read back: scalar fields in first-seen order plus the
/// criteria derived from the `Eligibility Criteria` field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialDocument {
    pub fields: Vec<(String, String)>,
    pub criteria: StructuredCriteria,
}

impl TrialDocument {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.field("Name")
    }

    pub fn eligibility_text(&self) -> Option<&str> {
        self.field(key_name(ELIGIBILITY_KEY))
    }

    pub fn detailed_info_link(&self) -> Option<&str> {
        self.field(key_name(DETAILED_INFO_KEY))
    }
}

fn key_name(row_key: &str) -> &str {
    row_key.trim_end_matches(':')
}

impl Serialize for TrialDocument {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(self.fields.len() + 2))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.serialize_entry("Inclusion Criteria", &self.criteria.inclusion)?;
        map.serialize_entry("Exclusion Criteria", &self.criteria.exclusion)?;
        map.end()
    }
}

/// Line-oriented parse of a row file. `Key:,value` opens a field, a long
/// hyphen run closes it, any other non-blank line continues the open field.
pub fn parse_document(text: &str) -> TrialDocument {
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut open: Option<usize> = None;

    for line in text.lines() {
        if SEPARATOR_RE.is_match(line) {
            open = None;
        } else if let Some(caps) = KEY_VALUE_RE.captures(line) {
            let key = caps[1].trim().to_string();
            let value = caps[2].trim().to_string();
            let idx = match fields.iter().position(|(k, _)| *k == key) {
                Some(i) => {
                    fields[i].1 = value;
                    i
                }
                None => {
                    fields.push((key, value));
                    fields.len() - 1
                }
            };
            open = Some(idx);
        } else if !line.trim().is_empty() {
            if let Some(i) = open {
                let value = &mut fields[i].1;
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(line.trim());
            }
        }
    }

    for (_, value) in fields.iter_mut() {
        *value = unquote(value);
    }

    let criteria = fields
        .iter()
        .find(|(k, _)| k == key_name(ELIGIBILITY_KEY))
        .map(|(_, v)| StructuredCriteria::from_eligibility_text(v))
        .unwrap_or_default();

    TrialDocument { fields, criteria }
}

/// Undo CSV field quoting on a reassembled value.
fn unquote(value: &str) -> String {
    match value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\"\"", "\"").trim().to_string(),
        None => value.to_string(),
    }
}

pub fn parse_row_file(path: &Path) -> Result<TrialDocument, StoreError> {
    Ok(parse_document(&read_row_file(path)?))
}
