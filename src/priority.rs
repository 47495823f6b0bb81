use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Serialize, Serializer};

use crate::record::is_sentinel;

static EXCLUSION_DELIMITER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:key\s+)?exclusion(?:\s+criteria)?\s*:").unwrap());
static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:\*|-|\d+[.)\-])").unwrap());

/// Ordering key for a trial's eligibility text. Variant order is the sort
/// order: inclusion-only trials first, then by bullet count, unparseable last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExclusionCount {
    /// No exclusion section at all (`-1`).
    NoExclusionSection,
    Bullets(usize),
    /// Missing, sentinel, or a delimiter with no recognisable bullets.
    Unparseable,
}

impl ExclusionCount {
    pub fn of(text: &str) -> Self {
        if is_unparseable(text) {
            return ExclusionCount::Unparseable;
        }
        let Some(delim) = EXCLUSION_DELIMITER.find(text) else {
            return ExclusionCount::NoExclusionSection;
        };
        match text[delim.end()..]
            .lines()
            .filter(|line| BULLET.is_match(line))
            .count()
        {
            0 => ExclusionCount::Unparseable,
            n => ExclusionCount::Bullets(n),
        }
    }

    /// Integer view: `-1` for no section, `None` for unparseable.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ExclusionCount::NoExclusionSection => Some(-1),
            ExclusionCount::Bullets(n) => Some(*n as i64),
            ExclusionCount::Unparseable => None,
        }
    }
}

fn is_unparseable(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    is_sentinel(&lower) || lower.contains("n/a") || lower.starts_with("api error")
}

impl fmt::Display for ExclusionCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_i64() {
            Some(n) => write!(f, "{}", n),
            None => f.write_str("inf"),
        }
    }
}

impl Serialize for ExclusionCount {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self.as_i64() {
            Some(n) => s.serialize_i64(n),
            None => s.serialize_str("inf"),
        }
    }
}

/// Stable sort by exclusion count, fewest first; ties keep encounter order.
pub fn rank_by_exclusion_density<T>(
    items: Vec<T>,
    eligibility_text: impl Fn(&T) -> &str,
) -> Vec<(ExclusionCount, T)> {
    let mut keyed: Vec<_> = items
        .into_iter()
        .map(|item| (ExclusionCount::of(eligibility_text(&item)), item))
        .collect();
    keyed.sort_by_key(|(count, _)| *count);
    keyed
}
