use std::future::Future;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::config::Settings;
use crate::crawler::collect_trial_links;
use crate::extract::{extract_trial, participation_link};
use crate::fetch::Fetch;
use crate::record::{sanitize_name, TrialRecord, NOT_AVAILABLE, SECTION_SEPARATOR};
use crate::registry::{RegistryClient, Study};

pub const STUDY_PAGE_BASE: &str = "https://clinicaltrials.gov/study";

/// Where trial records come from. Every implementation yields records of the
/// same row shape, so nothing downstream cares which one ran.
pub trait TrialSource {
    fn records(&self, cancer_type: &str, country: &str) -> impl Future<Output = Result<Vec<TrialRecord>>>;
}

/// Crawls the paginated trials website and extracts each detail page.
pub struct ListingSiteSource<'a, F> {
    fetcher: &'a F,
    settings: &'a Settings,
    progress: bool,
}

impl<'a, F: Fetch> ListingSiteSource<'a, F> {
    pub fn new(fetcher: &'a F, settings: &'a Settings) -> Self {
        ListingSiteSource {
            fetcher,
            settings,
            progress: false,
        }
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb
    }
}

impl<F: Fetch> TrialSource for ListingSiteSource<'_, F> {
    async fn records(&self, cancer_type: &str, country: &str) -> Result<Vec<TrialRecord>> {
        let base_url = self
            .settings
            .listing_url(cancer_type)
            .with_context(|| format!("No listing URL configured for cancer type '{}'", cancer_type))?;

        let links = collect_trial_links(self.fetcher, base_url, self.settings.max_pages)
            .await
            .with_context(|| format!("Crawl of {} failed", base_url))?;
        if links.is_empty() {
            warn!(cancer_type, country, url = %base_url, "No trial links found");
            return Ok(Vec::new());
        }

        let registry = RegistryClient::new(self.fetcher, self.settings);
        let pb = self.progress_bar(links.len());
        let mut records = Vec::with_capacity(links.len());
        let mut empty = 0usize;
        let mut failed = 0usize;

        for link in &links {
            match extract_trial(self.fetcher, &registry, link).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => empty += 1,
                Err(e) => {
                    warn!(url = %link, "Trial extraction failed: {}", e);
                    failed += 1;
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        info!(
            cancer_type,
            country,
            links = links.len(),
            extracted = records.len(),
            empty,
            failed,
            "Listing extraction finished"
        );
        Ok(records)
    }
}

/// Bulk registry search by condition and location.
pub struct RegistrySource<'a, F> {
    fetcher: &'a F,
    settings: &'a Settings,
}

impl<'a, F: Fetch> RegistrySource<'a, F> {
    pub fn new(fetcher: &'a F, settings: &'a Settings) -> Self {
        RegistrySource { fetcher, settings }
    }
}

impl<F: Fetch> TrialSource for RegistrySource<'_, F> {
    async fn records(&self, cancer_type: &str, country: &str) -> Result<Vec<TrialRecord>> {
        let registry = RegistryClient::new(self.fetcher, self.settings);
        let condition = self.settings.registry_query(cancer_type);
        let studies = match registry.search(condition, country).await {
            Ok(studies) => studies,
            Err(e) => {
                warn!(condition, country, "Registry search failed: {}", e);
                return Ok(Vec::new());
            }
        };
        if studies.is_empty() {
            warn!(condition, country, "No trials found");
        }

        let records: Vec<_> = studies
            .iter()
            .enumerate()
            .map(|(i, study)| study_record(study, i + 1))
            .collect();
        info!(condition, country, count = records.len(), "Registry records built");
        Ok(records)
    }
}

fn or_na(value: Option<&str>) -> String {
    value.unwrap_or(NOT_AVAILABLE).to_string()
}

fn row(key: &str, value: impl Into<String>) -> Vec<String> {
    vec![key.to_string(), value.into()]
}

/// Build the row file for one search result. `index` is 1-based.
pub fn study_record(study: &Study, index: usize) -> TrialRecord {
    let ps = &study.protocol_section;
    let ident = &ps.identification_module;
    let sponsor = ps.sponsor_collaborators_module.lead_sponsor.as_ref();
    let start_date = ps
        .status_module
        .start_date_struct
        .as_ref()
        .and_then(|d| d.date.as_deref());

    let id = study
        .nct_id()
        .map(str::to_string)
        .unwrap_or_else(|| format!("trial{}", index));

    let mut rows = vec![
        row("Name:", or_na(ident.brief_title.as_deref())),
        row("Number:", index.to_string()),
        row("Full Title:", or_na(ident.official_title.as_deref())),
        vec![SECTION_SEPARATOR.to_string()],
    ];
    if let Some(class) = sponsor.and_then(|s| s.agency_class.as_deref()) {
        rows.push(row("Principal Investigator:", class));
    }
    rows.push(row("Type:", or_na(ps.design_module.study_type.as_deref())));
    rows.push(row("Sponsor:", or_na(sponsor.and_then(|s| s.name.as_deref()))));
    rows.push(row("Recruitment Started:", format!("Global: {}", or_na(start_date))));
    rows.push(vec![SECTION_SEPARATOR.to_string()]);

    let detailed_info_link = format!("{}/{}", STUDY_PAGE_BASE, id);
    TrialRecord {
        registry_id: study.nct_id().map(str::to_string),
        storage_key: sanitize_name(&id),
        rows,
        participation_link: participation_link(&detailed_info_link),
        detailed_info_link,
        eligibility_text: or_na(study.eligibility_criteria()),
    }
}
