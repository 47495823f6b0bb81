//! Ingestion and classification entry points.
//!
//! `scrape_and_persist` runs the source for a (country, cancer type) bucket,
//! ranks the batch by exclusion density and swaps the bucket in. Everything
//! else reads persisted buckets back through the document parser.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Settings;
use crate::document::{parse_row_file, TrialDocument};
use crate::fetch::Fetch;
use crate::matcher::{classify, Classification, EligibilityRule, UNNAMED_TRIAL};
use crate::patient::{PatientField, PatientProfile};
use crate::priority::{rank_by_exclusion_density, ExclusionCount};
use crate::record::{is_sentinel, TrialRecord, ELIGIBILITY_KEY};
use crate::source::{ListingSiteSource, RegistrySource, TrialSource};
use crate::store::{bucket_dir, with_bucket, BucketWriter};

pub const ELIGIBILITY_NOT_FOUND: &str = "Eligibility not found";
pub const DISPLAY_NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, Serialize)]
pub struct RankedTrial {
    /// 1-based position after ranking.
    pub rank: usize,
    pub exclusions: ExclusionCount,
    pub record: TrialRecord,
}

impl RankedTrial {
    /// Row file stem. `list_row_files` orders on the numeric rank, so
    /// batches past 999 still read back in priority order.
    pub fn file_stem(&self) -> String {
        format!("{:03}_{}", self.rank, self.record.storage_key)
    }
}

/// Fetch every record for the bucket and rank it. The default country goes
/// through the listing site, anything else through the registry search.
pub async fn ingest<F: Fetch>(
    fetcher: &F,
    settings: &Settings,
    cancer_type: &str,
    country: &str,
    progress: bool,
) -> Result<Vec<RankedTrial>> {
    let records = if settings.is_default_country(country) {
        ListingSiteSource::new(fetcher, settings)
            .with_progress(progress)
            .records(cancer_type, country)
            .await?
    } else {
        RegistrySource::new(fetcher, settings)
            .records(cancer_type, country)
            .await?
    };

    Ok(rank_records(records))
}

pub fn rank_records(records: Vec<TrialRecord>) -> Vec<RankedTrial> {
    rank_by_exclusion_density(records, |r| r.eligibility_text.as_str())
        .into_iter()
        .enumerate()
        .map(|(i, (exclusions, record))| RankedTrial {
            rank: i + 1,
            exclusions,
            record,
        })
        .collect()
}

/// Stage every ranked record and swap the bucket in. On a write failure the
/// staged files are dropped and the live bucket is left as it was.
pub fn persist(
    settings: &Settings,
    country: &str,
    cancer_type: &str,
    ranked: &[RankedTrial],
) -> Result<Vec<PathBuf>> {
    let mut writer = BucketWriter::create(&settings.data_dir, country, cancer_type)?;
    for trial in ranked {
        if let Err(e) = writer.write(&trial.file_stem(), &trial.record.to_rows()) {
            if let Err(cleanup) = writer.discard() {
                warn!("Could not discard staged bucket: {}", cleanup);
            }
            return Err(e).context("Failed to write trial row file");
        }
    }
    Ok(writer.commit()?)
}

pub struct ScrapeReport {
    pub trials: Vec<RankedTrial>,
    pub files: Vec<PathBuf>,
}

pub async fn scrape_and_persist<F: Fetch>(
    fetcher: &F,
    settings: &Settings,
    cancer_type: &str,
    country: &str,
    progress: bool,
) -> Result<ScrapeReport> {
    let trials = ingest(fetcher, settings, cancer_type, country, progress).await?;
    let files = persist(settings, country, cancer_type, &trials)?;
    info!(cancer_type, country, count = files.len(), "Bucket refreshed");
    Ok(ScrapeReport { trials, files })
}

/// Parse every row file of a bucket in file order. Unreadable files are
/// logged and skipped.
pub fn load_bucket(settings: &Settings, country: &str, cancer_type: &str) -> Result<Vec<TrialDocument>> {
    let dir = bucket_dir(&settings.data_dir, country, cancer_type);
    let docs = with_bucket(&dir, |files| {
        files
            .iter()
            .filter_map(|path| match parse_row_file(path) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!(path = %path.display(), "Skipping row file: {}", e);
                    None
                }
            })
            .collect()
    })?;
    Ok(docs)
}

/// What a front end shows per trial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialSummary {
    pub name: String,
    pub eligibility: String,
    pub link: String,
}

impl TrialSummary {
    pub fn from_document(doc: &TrialDocument) -> Self {
        let eligibility = match doc.eligibility_text() {
            None => ELIGIBILITY_NOT_FOUND.to_string(),
            Some(text) => {
                let text = text.strip_prefix(ELIGIBILITY_KEY).unwrap_or(text).trim();
                if is_sentinel(text) {
                    DISPLAY_NOT_AVAILABLE.to_string()
                } else {
                    text.to_string()
                }
            }
        };
        let link = doc
            .detailed_info_link()
            .filter(|l| !is_sentinel(l))
            .unwrap_or(DISPLAY_NOT_AVAILABLE)
            .to_string();

        TrialSummary {
            name: doc.name().unwrap_or(UNNAMED_TRIAL).to_string(),
            eligibility,
            link,
        }
    }
}

pub fn summarize(settings: &Settings, country: &str, cancer_type: &str) -> Result<Vec<TrialSummary>> {
    Ok(load_bucket(settings, country, cancer_type)?
        .iter()
        .map(TrialSummary::from_document)
        .collect())
}

/// Refresh the bucket, then return its display projection.
pub async fn run_classification<F: Fetch>(
    fetcher: &F,
    settings: &Settings,
    cancer_type: &str,
    country: &str,
) -> Result<Vec<TrialSummary>> {
    scrape_and_persist(fetcher, settings, cancer_type, country, false).await?;
    summarize(settings, country, cancer_type)
}

pub fn bucket_rules(settings: &Settings, country: &str, cancer_type: &str) -> Result<Vec<EligibilityRule>> {
    Ok(load_bucket(settings, country, cancer_type)?
        .iter()
        .map(EligibilityRule::from_document)
        .collect())
}

/// Run one patient against every trial of a bucket with the keyword engine.
pub fn classify_against_bucket(
    settings: &Settings,
    patient: &PatientProfile,
    country: &str,
    cancer_type: &str,
) -> Result<Classification> {
    let rules = bucket_rules(settings, country, cancer_type)?;
    if rules.is_empty() {
        warn!(country, cancer_type, "Bucket has no trials");
    }
    Ok(classify(patient, &rules))
}

/// Every patient against every rule; one classification per patient, in
/// input order.
pub fn screen(patients: &[PatientProfile], rules: &[EligibilityRule]) -> Vec<Classification> {
    patients.par_iter().map(|p| classify(p, rules)).collect()
}

/// Patient cancer-type label to the bucket that holds its trials.
pub fn patient_bucket(cancer_type: &str) -> Option<&'static str> {
    match cancer_type.trim().to_lowercase().as_str() {
        "breast" => Some("breast"),
        "lung" => Some("lung"),
        "myeloma" => Some("multiple_myeloma"),
        "prostate" => Some("genitourinary"),
        "cll" => Some("cll"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OpenTrials {
    Trials(Vec<String>),
    NoOpenTrials,
    NotRecognized,
}

impl fmt::Display for OpenTrials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenTrials::Trials(names) => f.write_str(&names.join("; ")),
            OpenTrials::NoOpenTrials => f.write_str("No open trials"),
            OpenTrials::NotRecognized => f.write_str("Cancer type not recognized"),
        }
    }
}

/// Trial names open for the patient's cancer type in the default country.
pub fn open_trials_for(settings: &Settings, patient: &PatientProfile) -> Result<OpenTrials> {
    let Some(bucket) = patient
        .get(PatientField::CancerType)
        .map(ToString::to_string)
        .as_deref()
        .and_then(patient_bucket)
    else {
        return Ok(OpenTrials::NotRecognized);
    };

    let names: Vec<String> = load_bucket(settings, &settings.default_country, bucket)?
        .iter()
        .filter_map(|d| d.name().map(str::to_string))
        .collect();
    Ok(if names.is_empty() {
        OpenTrials::NoOpenTrials
    } else {
        OpenTrials::Trials(names)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::StaticFetcher;
    use crate::matcher::AggregateLabel;
    use crate::patient::FieldValue;
    use crate::record::{ERROR_SENTINEL, NOT_AVAILABLE, SECTION_SEPARATOR};
    use crate::store::list_row_files;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}", name)).unwrap()
    }

    fn settings(data_dir: &std::path::Path) -> Settings {
        let mut s = Settings {
            data_dir: data_dir.to_path_buf(),
            registry_base_url: "https://registry.test/studies".into(),
            ..Settings::default()
        };
        s.listing_urls
            .insert("Breast".into(), "https://trials.test/breast/".into());
        s
    }

    fn record(key: &str, eligibility: &str) -> TrialRecord {
        TrialRecord {
            registry_id: None,
            storage_key: key.into(),
            rows: vec![
                vec!["Name:".into(), key.replace('_', " ")],
                vec![SECTION_SEPARATOR.into()],
            ],
            detailed_info_link: NOT_AVAILABLE.into(),
            participation_link: NOT_AVAILABLE.into(),
            eligibility_text: eligibility.into(),
        }
    }

    #[test]
    fn ranking_orders_and_numbers() {
        let ranked = rank_records(vec![
            record("Broken", ERROR_SENTINEL),
            record("Two", "Exclusion Criteria:\n* a\n* b"),
            record("Open", "Adults only"),
            record("One", "Exclusion Criteria:\n* a"),
        ]);
        let keys: Vec<_> = ranked.iter().map(|r| r.file_stem()).collect();
        assert_eq!(keys, vec!["001_Open", "002_One", "003_Two", "004_Broken"]);
        assert_eq!(ranked[3].exclusions, ExclusionCount::Unparseable);
    }

    #[test]
    fn persisted_bucket_reads_back_in_rank_order() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let ranked = rank_records(vec![
            record("Later", "Exclusion Criteria:\n* a\n* b"),
            record("First", "Adults with measurable disease"),
        ]);
        persist(&s, "Ireland", "Breast", &ranked).unwrap();

        let docs = load_bucket(&s, "Ireland", "Breast").unwrap();
        let names: Vec<_> = docs.iter().filter_map(|d| d.name()).collect();
        assert_eq!(names, vec!["First", "Later"]);
    }

    #[test]
    fn summary_shows_sentinels_as_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let ranked = rank_records(vec![record("Failed_Lookup", ERROR_SENTINEL), record("No_Link", "n/a")]);
        persist(&s, "Ireland", "Lung", &ranked).unwrap();

        let summaries = summarize(&s, "Ireland", "Lung").unwrap();
        assert_eq!(summaries.len(), 2);
        for summary in &summaries {
            assert_eq!(summary.eligibility, DISPLAY_NOT_AVAILABLE);
            assert_eq!(summary.link, DISPLAY_NOT_AVAILABLE);
        }
    }

    #[test]
    fn summary_defaults_for_bare_file() {
        let doc = crate::document::parse_document("Type:,Interventional\n");
        let summary = TrialSummary::from_document(&doc);
        assert_eq!(summary.name, UNNAMED_TRIAL);
        assert_eq!(summary.eligibility, ELIGIBILITY_NOT_FOUND);
    }

    #[tokio::test]
    async fn classification_entry_point_scrapes_then_projects() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let fetcher = StaticFetcher::new()
            .with("https://trials.test/breast/", &fixture("listing_page1.html"))
            .with("https://trials.test/breast/page/2/", &fixture("listing_page2.html"))
            .with("https://trials.test/trial/treat-ctdna/", &fixture("trial_detail.html"))
            .with(
                "https://registry.test/studies/NCT05512364",
                &fixture("study_NCT05512364.json"),
            );

        let summaries = run_classification(&fetcher, &s, "Breast", "Ireland").await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "TREAT ctDNA study");
        assert_eq!(summaries[0].link, "https://clinicaltrials.gov/study/NCT05512364");
        assert!(summaries[0].eligibility.contains("Known BRCA1 mutation"));

        let files = list_row_files(&bucket_dir(dir.path(), "Ireland", "Breast")).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("001_TREAT_ctDNA_study.csv"));
    }

    #[test]
    fn row_file_round_trip_keeps_eligibility() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let source = fixture("eligibility_delimited.txt");
        let ranked = rank_records(vec![record("Round_Trip", source.trim_end())]);
        persist(&s, "Ireland", "CLL", &ranked).unwrap();

        let docs = load_bucket(&s, "Ireland", "CLL").unwrap();
        let normalize = |t: &str| t.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(
            normalize(docs[0].eligibility_text().unwrap()),
            normalize(&source)
        );
        let expected = crate::document::StructuredCriteria::from_eligibility_text(&normalize(&source));
        assert_eq!(docs[0].criteria.inclusion.len(), expected.inclusion.len());
        assert_eq!(docs[0].criteria.exclusion.len(), 3);
        assert_eq!(docs[0].criteria.inclusion.len(), 2);
    }

    #[test]
    fn keyword_classification_over_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let ranked = rank_records(vec![
            record("Excludes_BRCA", "Inclusion: Adults. || Exclusion: Known BRCA1 mutation. Pregnancy."),
            record("Open_Study", "Inclusion: Adults. || Exclusion: Prior elacestrant."),
        ]);
        persist(&s, "Ireland", "Breast", &ranked).unwrap();

        let patient = PatientProfile::new().with(PatientField::GeneticMutations, FieldValue::Text("BRCA1".into()));
        let c = classify_against_bucket(&s, &patient, "Ireland", "Breast").unwrap();
        assert_eq!((c.eligible, c.evaluated), (1, 2));
        assert_eq!(c.label, AggregateLabel::EligibleForMost);
    }

    #[test]
    fn screen_keeps_patient_order() {
        let rule: EligibilityRule = serde_json::from_str::<crate::matcher::StructuredTrial>(
            r#"{"name": "Adults", "inclusion_criteria": {"age_min": 18}}"#,
        )
        .unwrap()
        .into();
        let patients: Vec<_> = [30.0, 12.0, 65.0]
            .into_iter()
            .map(|age| PatientProfile::new().with(PatientField::Age, FieldValue::Number(age)))
            .collect();
        let labels: Vec<_> = screen(&patients, &[rule]).into_iter().map(|c| c.label).collect();
        assert_eq!(
            labels,
            vec![AggregateLabel::EligibleForMost, AggregateLabel::NotEligible, AggregateLabel::EligibleForMost]
        );
    }

    #[test]
    fn open_trials_by_patient_cancer_type() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        persist(&s, "Ireland", "Multiple Myeloma", &rank_records(vec![record("MM_Study", "n/a")])).unwrap();

        let patient = |ct: &str| PatientProfile::new().with(PatientField::CancerType, FieldValue::Text(ct.into()));
        assert_eq!(
            open_trials_for(&s, &patient("Myeloma")).unwrap(),
            OpenTrials::Trials(vec!["MM Study".into()])
        );
        assert_eq!(open_trials_for(&s, &patient("lung")).unwrap(), OpenTrials::NoOpenTrials);
        assert_eq!(open_trials_for(&s, &patient("melanoma")).unwrap().to_string(), "Cancer type not recognized");
        assert_eq!(open_trials_for(&s, &PatientProfile::new()).unwrap(), OpenTrials::NotRecognized);
    }
}
