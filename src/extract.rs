use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};
use url::Url;

use crate::error::FetchError;
use crate::fetch::Fetch;
use crate::record::{sanitize_name, TrialRecord, NOT_AVAILABLE, SECTION_SEPARATOR, UNKNOWN_TRIAL};
use crate::registry::RegistryClient;

static DATA_TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table.table").unwrap());
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td, th").unwrap());
static DETAIL_LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h2 + a.btn-login").unwrap());
static NCT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"NCT\d+").unwrap());

const PARTICIPATION_FRAGMENT: &str = "#participation-criteria";

/// The site-specific part of a detail page.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailPage {
    pub storage_key: String,
    pub rows: Vec<Vec<String>>,
    pub detailed_info_link: String,
}

/// Parse a trial detail page. `None` when the page carries no data table.
pub fn parse_detail_page(html: &str, page_url: &str) -> Option<DetailPage> {
    let doc = Html::parse_document(html);
    let tables: Vec<_> = doc.select(&DATA_TABLE).collect();
    if tables.is_empty() {
        return None;
    }

    let mut storage_key = UNKNOWN_TRIAL.to_string();
    let mut rows = Vec::new();
    for table in tables {
        for tr in table.select(&ROW) {
            let cells: Vec<String> = tr.select(&CELL).map(cell_text).collect();
            if cells.first().is_some_and(|c| c.starts_with("Name:")) {
                if let Some(name) = cells.get(1) {
                    storage_key = sanitize_name(name);
                }
            }
            rows.push(cells);
        }
        rows.push(vec![SECTION_SEPARATOR.to_string()]);
    }

    Some(DetailPage {
        storage_key,
        rows,
        detailed_info_link: detailed_info_link(&doc, page_url),
    })
}

/// Text nodes trimmed and joined with single spaces.
fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The "more detailed information" button that follows a heading. A link
/// back to the page itself counts as no link.
fn detailed_info_link(doc: &Html, page_url: &str) -> String {
    let Some(href) = doc
        .select(&DETAIL_LINK)
        .next()
        .and_then(|a| a.value().attr("href"))
    else {
        return NOT_AVAILABLE.to_string();
    };

    match Url::parse(page_url) {
        Ok(base) => match base.join(href) {
            Ok(resolved) if resolved == base => NOT_AVAILABLE.to_string(),
            Ok(resolved) => resolved.into(),
            Err(_) => NOT_AVAILABLE.to_string(),
        },
        Err(_) if href == page_url => NOT_AVAILABLE.to_string(),
        Err(_) => href.to_string(),
    }
}

pub fn participation_link(detailed_info_link: &str) -> String {
    if detailed_info_link == NOT_AVAILABLE {
        NOT_AVAILABLE.to_string()
    } else {
        format!("{}{}", detailed_info_link, PARTICIPATION_FRAGMENT)
    }
}

pub fn registry_id(link: &str) -> Option<&str> {
    NCT_RE.find(link).map(|m| m.as_str())
}

/// Assemble a record from a parsed page, looking the eligibility text up in
/// the registry when the participation link names a study.
pub async fn assemble_record<F: Fetch>(registry: &RegistryClient<'_, F>, page: DetailPage) -> TrialRecord {
    let participation = participation_link(&page.detailed_info_link);
    let id = registry_id(&participation).map(str::to_string);
    let eligibility_text = match &id {
        Some(nct) => registry.eligibility_text(nct).await,
        None => {
            debug!(link = %participation, "No registry id, skipping eligibility lookup");
            NOT_AVAILABLE.to_string()
        }
    };

    TrialRecord {
        registry_id: id,
        storage_key: page.storage_key,
        rows: page.rows,
        detailed_info_link: page.detailed_info_link,
        participation_link: participation,
        eligibility_text,
    }
}

/// Fetch and extract one detail page. `Ok(None)` means the page had no trial
/// table; a fetch error for the page itself is returned to the caller.
pub async fn extract_trial<F: Fetch>(
    fetcher: &F,
    registry: &RegistryClient<'_, F>,
    url: &str,
) -> Result<Option<TrialRecord>, FetchError> {
    info!(url = %url, "Extracting trial data");
    let html = fetcher.fetch(url, None).await?;
    let Some(page) = parse_detail_page(&html, url) else {
        info!(url = %url, "No trial tables found");
        return Ok(None);
    };
    Ok(Some(assemble_record(registry, page).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::fetch::testing::StaticFetcher;
    use crate::record::{ERROR_SENTINEL, DETAILED_INFO_KEY, ELIGIBILITY_KEY};

    const PAGE: &str = "https://trials.test/trial/treat-ctdna/";

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}", name)).unwrap()
    }

    fn settings() -> Settings {
        Settings {
            registry_base_url: "https://registry.test/studies".into(),
            ..Settings::default()
        }
    }

    #[test]
    fn detail_page_rows_and_name() {
        let page = parse_detail_page(&fixture("trial_detail.html"), PAGE).unwrap();
        assert_eq!(page.storage_key, "TREAT_ctDNA_study");
        assert_eq!(page.rows[0], vec!["Name:", "TREAT ctDNA study"]);
        // 3 + 3 table rows, one separator after each table
        assert_eq!(page.rows.len(), 8);
        assert_eq!(page.rows[3], vec![SECTION_SEPARATOR]);
        assert_eq!(page.rows[7], vec![SECTION_SEPARATOR]);
        assert_eq!(page.detailed_info_link, "https://clinicaltrials.gov/study/NCT05512364");
    }

    #[test]
    fn page_without_tables_is_skipped() {
        assert!(parse_detail_page("<html><body><h2>Closed</h2></body></html>", PAGE).is_none());
    }

    #[test]
    fn self_link_is_not_available() {
        let html = r#"<table class="table"><tr><td>Name:</td><td>X</td></tr></table>
            <h2>More</h2><a class="btn-login" href="/trial/treat-ctdna/">Here</a>"#;
        let page = parse_detail_page(html, PAGE).unwrap();
        assert_eq!(page.detailed_info_link, NOT_AVAILABLE);
    }

    #[test]
    fn missing_name_row_gets_placeholder_key() {
        let html = r#"<table class="table"><tr><td>Type:</td><td>Observational</td></tr></table>"#;
        let page = parse_detail_page(html, PAGE).unwrap();
        assert_eq!(page.storage_key, UNKNOWN_TRIAL);
        assert_eq!(page.detailed_info_link, NOT_AVAILABLE);
    }

    #[test]
    fn derived_links() {
        assert_eq!(participation_link("n/a"), "n/a");
        let p = participation_link("https://clinicaltrials.gov/study/NCT05512364");
        assert_eq!(p, "https://clinicaltrials.gov/study/NCT05512364#participation-criteria");
        assert_eq!(registry_id(&p), Some("NCT05512364"));
        assert_eq!(registry_id("https://example.org/trial/42#participation-criteria"), None);
    }

    #[tokio::test]
    async fn extract_with_registry_lookup() {
        let s = settings();
        let fetcher = StaticFetcher::new()
            .with(PAGE, &fixture("trial_detail.html"))
            .with(
                "https://registry.test/studies/NCT05512364",
                &fixture("study_NCT05512364.json"),
            );
        let registry = RegistryClient::new(&fetcher, &s);
        let rec = extract_trial(&fetcher, &registry, PAGE).await.unwrap().unwrap();
        assert_eq!(rec.registry_id.as_deref(), Some("NCT05512364"));
        assert!(rec.eligibility_text.contains("Exclusion Criteria:"));

        let rows = rec.to_rows();
        let n = rows.len();
        assert_eq!(rows[n - 3][0], DETAILED_INFO_KEY);
        assert_eq!(rows[n - 1][0], ELIGIBILITY_KEY);
    }

    #[tokio::test]
    async fn lookup_failure_is_error_sentinel() {
        let s = settings();
        let fetcher = StaticFetcher::new().with(PAGE, &fixture("trial_detail.html"));
        let registry = RegistryClient::new(&fetcher, &s);
        let rec = extract_trial(&fetcher, &registry, PAGE).await.unwrap().unwrap();
        assert_eq!(rec.eligibility_text, ERROR_SENTINEL);
    }

    #[tokio::test]
    async fn no_registry_id_skips_lookup() {
        let s = settings();
        let html = r#"<table class="table"><tr><td>Name:</td><td>Local Study</td></tr></table>
            <h2>More</h2><a class="btn-login" href="https://hospital.test/local-study">Info</a>"#;
        let fetcher = StaticFetcher::new().with(PAGE, html);
        let registry = RegistryClient::new(&fetcher, &s);
        let rec = extract_trial(&fetcher, &registry, PAGE).await.unwrap().unwrap();
        assert_eq!(rec.eligibility_text, NOT_AVAILABLE);
        assert_eq!(rec.participation_link, "https://hospital.test/local-study#participation-criteria");
        assert_eq!(fetcher.requests(), vec![PAGE]);
    }
}
