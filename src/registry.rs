//! Client for the trial registry's v2 studies endpoint.
//!
//! Single-study lookup: `GET {base}/{NCT id}`.
//! Bulk search: `GET {base}?query.cond=..&query.locn=..&filter.overallStatus=..&pageSize=..`.
//! Both return studies under the same nested `protocolSection` shape.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::Settings;
use crate::error::FetchError;
use crate::fetch::Fetch;
use crate::record::{ERROR_SENTINEL, NOT_AVAILABLE};

pub const RECRUITING_FILTER: &str = "RECRUITING|NOT_YET_RECRUITING";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Study {
    pub protocol_section: ProtocolSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolSection {
    pub identification_module: IdentificationModule,
    pub status_module: StatusModule,
    pub sponsor_collaborators_module: SponsorCollaboratorsModule,
    pub design_module: DesignModule,
    pub eligibility_module: EligibilityModule,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdentificationModule {
    pub nct_id: Option<String>,
    pub brief_title: Option<String>,
    pub official_title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusModule {
    pub start_date_struct: Option<DateStruct>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DateStruct {
    pub date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SponsorCollaboratorsModule {
    pub lead_sponsor: Option<LeadSponsor>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeadSponsor {
    pub name: Option<String>,
    pub agency_class: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DesignModule {
    pub study_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EligibilityModule {
    pub eligibility_criteria: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StudiesPage {
    studies: Vec<Study>,
}

impl Study {
    pub fn nct_id(&self) -> Option<&str> {
        self.protocol_section.identification_module.nct_id.as_deref()
    }

    /// Raw eligibility text, `None` when missing or blank.
    pub fn eligibility_criteria(&self) -> Option<&str> {
        self.protocol_section
            .eligibility_module
            .eligibility_criteria
            .as_deref()
            .filter(|t| !t.trim().is_empty())
    }
}

pub struct RegistryClient<'a, F> {
    fetcher: &'a F,
    base_url: String,
    lookup_timeout: Duration,
    page_size: u32,
}

impl<'a, F: Fetch> RegistryClient<'a, F> {
    pub fn new(fetcher: &'a F, settings: &Settings) -> Self {
        RegistryClient {
            fetcher,
            base_url: settings.registry_base_url.trim_end_matches('/').to_string(),
            lookup_timeout: settings.lookup_timeout(),
            page_size: settings.registry_page_size,
        }
    }

    pub fn study_url(&self, nct_id: &str) -> String {
        format!("{}/{}", self.base_url, nct_id)
    }

    pub fn search_url(&self, condition: &str, location: &str) -> Result<String, FetchError> {
        let page_size = self.page_size.to_string();
        Url::parse_with_params(
            &self.base_url,
            &[
                ("query.cond", condition),
                ("query.locn", location),
                ("filter.overallStatus", RECRUITING_FILTER),
                ("pageSize", page_size.as_str()),
            ],
        )
        .map(String::from)
        .map_err(|source| FetchError::Url {
            url: self.base_url.clone(),
            source,
        })
    }

    pub async fn fetch_study(&self, nct_id: &str) -> Result<Study, FetchError> {
        let body = self
            .fetcher
            .fetch(&self.study_url(nct_id), Some(self.lookup_timeout))
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Eligibility text for one study, never failing: empty criteria become
    /// `n/a` and any fetch or decode failure becomes the `Error` sentinel.
    pub async fn eligibility_text(&self, nct_id: &str) -> String {
        match self.fetch_study(nct_id).await {
            Ok(study) => study
                .eligibility_criteria()
                .map(str::to_string)
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            Err(e) => {
                warn!(nct_id, "Registry lookup failed: {}", e);
                ERROR_SENTINEL.to_string()
            }
        }
    }

    pub async fn search(&self, condition: &str, location: &str) -> Result<Vec<Study>, FetchError> {
        let url = self.search_url(condition, location)?;
        let body = self.fetcher.fetch(&url, None).await?;
        let page: StudiesPage = serde_json::from_str(&body)?;
        debug!(condition, location, count = page.studies.len(), "Registry search");
        Ok(page.studies)
    }
}
