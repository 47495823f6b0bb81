use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PatientError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Infer a value from a CSV cell: booleans, then numbers, then text.
    /// Blank cells carry no value.
    pub fn from_cell(cell: &str) -> Option<Self> {
        let cell = cell.trim();
        if cell.is_empty() {
            return None;
        }
        if cell.eq_ignore_ascii_case("true") {
            return Some(FieldValue::Bool(true));
        }
        if cell.eq_ignore_ascii_case("false") {
            return Some(FieldValue::Bool(false));
        }
        match cell.parse::<f64>() {
            Ok(n) if n.is_finite() => Some(FieldValue::Number(n)),
            _ => Some(FieldValue::Text(cell.to_string())),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse().ok(),
            FieldValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            FieldValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => Some(true),
                "false" | "no" => Some(false),
                _ => None,
            },
            FieldValue::Number(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Number(n) => f.write_str(&format_number(*n)),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

/// `18.0` -> `"18"`, `1.5` -> `"1.5"`.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Patient attributes the matchers understand. Input keys are matched after
/// lower-casing and dropping `_`, `-` and spaces, so `ECOGPerformanceStatus`,
/// `ecog_performance_status` and `ecog` all land on the same field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PatientField {
    PatientId,
    CancerType,
    Age,
    Gender,
    Diagnosis,
    Stage,
    EcogPerformanceStatus,
    TreatmentHistory,
    PriorTreatmentLines,
    MeasurableDisease,
    Comorbidities,
    GeneticMutations,
    OrganFunctionStatus,
    PreviousCancerHistory,
    PresenceOfMetastases,
    PregnancyBreastfeedingStatus,
}

impl PatientField {
    pub const ALL: [PatientField; 16] = [
        PatientField::PatientId,
        PatientField::CancerType,
        PatientField::Age,
        PatientField::Gender,
        PatientField::Diagnosis,
        PatientField::Stage,
        PatientField::EcogPerformanceStatus,
        PatientField::TreatmentHistory,
        PatientField::PriorTreatmentLines,
        PatientField::MeasurableDisease,
        PatientField::Comorbidities,
        PatientField::GeneticMutations,
        PatientField::OrganFunctionStatus,
        PatientField::PreviousCancerHistory,
        PatientField::PresenceOfMetastases,
        PatientField::PregnancyBreastfeedingStatus,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PatientField::PatientId => "PatientId",
            PatientField::CancerType => "CancerType",
            PatientField::Age => "Age",
            PatientField::Gender => "Gender",
            PatientField::Diagnosis => "Diagnosis",
            PatientField::Stage => "Stage",
            PatientField::EcogPerformanceStatus => "ECOGPerformanceStatus",
            PatientField::TreatmentHistory => "TreatmentHistory",
            PatientField::PriorTreatmentLines => "PriorTreatmentLines",
            PatientField::MeasurableDisease => "MeasurableDisease",
            PatientField::Comorbidities => "Comorbidities",
            PatientField::GeneticMutations => "GeneticMutations",
            PatientField::OrganFunctionStatus => "OrganFunctionStatus",
            PatientField::PreviousCancerHistory => "PreviousCancerHistory",
            PatientField::PresenceOfMetastases => "PresenceOfMetastases",
            PatientField::PregnancyBreastfeedingStatus => "PregnancyBreastfeedingStatus",
        }
    }

    fn aliases(self) -> &'static [&'static str] {
        match self {
            PatientField::PatientId => &["patientid", "id"],
            PatientField::CancerType => &["cancertype"],
            PatientField::Age => &["age"],
            PatientField::Gender => &["gender", "sex"],
            PatientField::Diagnosis => &["diagnosis"],
            PatientField::Stage => &["stage", "staging"],
            PatientField::EcogPerformanceStatus => &["ecog", "ecogperformancestatus"],
            PatientField::TreatmentHistory => &["treatmenthistory", "priortreatment"],
            PatientField::PriorTreatmentLines => &["priorlines", "priortreatmentlines"],
            PatientField::MeasurableDisease => &["measurabledisease"],
            PatientField::Comorbidities => &["comorbidities"],
            PatientField::GeneticMutations => &["geneticmutations"],
            PatientField::OrganFunctionStatus => &["organfunctionstatus"],
            PatientField::PreviousCancerHistory => &["previouscancerhistory"],
            PatientField::PresenceOfMetastases => &["presenceofmetastases"],
            PatientField::PregnancyBreastfeedingStatus => &["pregnancybreastfeedingstatus"],
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let norm: String = key
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        Self::ALL
            .into_iter()
            .find(|f| f.aliases().contains(&norm.as_str()))
    }
}

impl fmt::Display for PatientField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for PatientField {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.name())
    }
}

/// A patient as the matchers see it: recognised fields plus an extension bag
/// for everything else. Extension fields never influence a verdict.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientProfile {
    known: BTreeMap<PatientField, FieldValue>,
    extension: BTreeMap<String, FieldValue>,
}

impl PatientProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldValue)>,
        K: AsRef<str>,
    {
        let mut profile = Self::new();
        for (k, v) in pairs {
            profile.insert(k.as_ref(), v);
        }
        profile
    }

    pub fn insert(&mut self, key: &str, value: FieldValue) {
        match PatientField::from_key(key) {
            Some(field) => {
                self.known.insert(field, value);
            }
            None => {
                self.extension.insert(key.to_string(), value);
            }
        }
    }

    pub fn set(&mut self, field: PatientField, value: FieldValue) {
        self.known.insert(field, value);
    }

    pub fn with(mut self, field: PatientField, value: FieldValue) -> Self {
        self.set(field, value);
        self
    }

    pub fn get(&self, field: PatientField) -> Option<&FieldValue> {
        self.known.get(&field)
    }

    pub fn text(&self, field: PatientField) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_text)
    }

    pub fn number(&self, field: PatientField) -> Option<f64> {
        self.get(field).and_then(FieldValue::as_number)
    }

    pub fn flag(&self, field: PatientField) -> Option<bool> {
        self.get(field).and_then(FieldValue::as_bool)
    }

    pub fn known(&self) -> impl Iterator<Item = (PatientField, &FieldValue)> {
        self.known.iter().map(|(f, v)| (*f, v))
    }

    pub fn extension(&self) -> &BTreeMap<String, FieldValue> {
        &self.extension
    }

    /// Identifier for reports: the `PatientId` field or `#<index>`.
    pub fn label(&self, index: usize) -> String {
        self.get(PatientField::PatientId)
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("#{}", index + 1))
    }
}

impl<'de> Deserialize<'de> for PatientProfile {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Option<FieldValue>>::deserialize(d)?;
        Ok(Self::from_pairs(
            raw.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))),
        ))
    }
}

impl Serialize for PatientProfile {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = s.serialize_map(Some(self.known.len() + self.extension.len()))?;
        for (field, value) in &self.known {
            map.serialize_entry(field.name(), value)?;
        }
        for (key, value) in &self.extension {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Load one patient (JSON object) or many (JSON array, or CSV with a header
/// row). Format is chosen by file extension.
pub fn load_patients(path: &Path) -> Result<Vec<PatientProfile>, PatientError> {
    let text = std::fs::read_to_string(path).map_err(|source| PatientError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let is_json = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        parse_patients_json(&text)
    } else {
        parse_patients_csv(&text)
    }
}

pub fn parse_patients_json(text: &str) -> Result<Vec<PatientProfile>, PatientError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<PatientProfile>),
        One(PatientProfile),
    }

    Ok(match serde_json::from_str(text)? {
        OneOrMany::Many(v) => v,
        OneOrMany::One(p) => vec![p],
    })
}

pub fn parse_patients_csv(text: &str) -> Result<Vec<PatientProfile>, PatientError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader.headers()?.clone();

    let mut patients = Vec::new();
    for record in reader.records() {
        let record = record?;
        patients.push(PatientProfile::from_pairs(
            headers
                .iter()
                .zip(record.iter())
                .filter_map(|(h, cell)| FieldValue::from_cell(cell).map(|v| (h, v))),
        ));
    }
    Ok(patients)
}
