use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::Config;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_FILE: &str = "trial_matcher.toml";
const ENV_PREFIX: &str = "TRIALS";

/// Runtime settings. Built once in `main` and handed to every component that
/// needs it; nothing reads configuration from ambient state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub default_country: String,
    /// Cancer type -> paginated listing URL on the trials website.
    pub listing_urls: BTreeMap<String, String>,
    /// Cancer type -> condition query for the registry bulk search.
    pub registry_queries: BTreeMap<String, String>,
    pub registry_base_url: String,
    pub registry_page_size: u32,
    pub request_timeout_secs: u64,
    pub lookup_timeout_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_pages: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let listing_urls = [
            ("Breast", "https://www.cancertrials.ie/current-trials/breast/"),
            ("Lung", "https://www.cancertrials.ie/current-trials/lung/"),
            (
                "Multiple Myeloma",
                "https://www.cancertrials.ie/current-trials/lymphoma-blood-cancers/multiple-myeloma/",
            ),
            ("Genitourinary", "https://www.cancertrials.ie/current-trials/genitourinary/"),
            (
                "CLL",
                "https://www.cancertrials.ie/current-trials/lymphoma-blood-cancers/chronic-lymphocytic-leukaemia-cll/",
            ),
        ];
        let registry_queries = [
            ("Breast", "Breast Cancer"),
            ("Lung", "Lung Cancer"),
            ("Multiple Myeloma", "Multiple Myeloma"),
            ("Genitourinary", "Prostate Cancer"),
            ("CLL", "Chronic Lymphocytic Leukemia"),
        ];

        Settings {
            data_dir: PathBuf::from("trials_data"),
            default_country: "Ireland".to_string(),
            listing_urls: to_map(&listing_urls),
            registry_queries: to_map(&registry_queries),
            registry_base_url: "https://clinicaltrials.gov/api/v2/studies".to_string(),
            registry_page_size: 50,
            request_timeout_secs: 30,
            lookup_timeout_secs: 10,
            max_retries: 3,
            base_backoff_ms: 2000,
            max_pages: 200,
        }
    }
}

fn to_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Settings {
    /// TOML file (optional unless given explicitly), then `TRIALS_*`
    /// environment variables (`TRIALS_DATA_DIR`; `__` separates nested keys). Keys absent from both keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build settings")?
            .try_deserialize()
            .context("Invalid settings")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn listing_url(&self, cancer_type: &str) -> Option<&str> {
        lookup_ignore_case(&self.listing_urls, cancer_type)
    }

    /// Registry condition query for a cancer type, falling back to the raw label.
    pub fn registry_query<'a>(&'a self, cancer_type: &'a str) -> &'a str {
        lookup_ignore_case(&self.registry_queries, cancer_type).unwrap_or(cancer_type)
    }

    pub fn is_default_country(&self, country: &str) -> bool {
        country.trim().eq_ignore_ascii_case(&self.default_country)
    }
}

fn lookup_ignore_case<'a>(map: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    let key = key.trim();
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_listing_and_registry_maps() {
        let s = Settings::default();
        assert_eq!(s.listing_urls.len(), 5);
        assert_eq!(s.registry_query("Genitourinary"), "Prostate Cancer");
        assert_eq!(s.registry_query("Melanoma"), "Melanoma");
    }

    #[test]
    fn lookups_ignore_case() {
        let s = Settings::default();
        assert!(s.listing_url("breast").is_some());
        assert!(s.listing_url("multiple myeloma").is_some());
        assert!(s.listing_url("Melanoma").is_none());
        assert!(s.is_default_country(" ireland "));
        assert!(!s.is_default_country("Germany"));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "data_dir = \"out\"\nmax_pages = 7\n").unwrap();
        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.data_dir, PathBuf::from("out"));
        assert_eq!(s.max_pages, 7);
        assert_eq!(s.default_country, "Ireland");
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "registry_page_size = 10\nlookup_timeout_secs = 4\n").unwrap();

        // keys no other test sets, since the environment is process-wide
        std::env::set_var("TRIALS_REGISTRY_PAGE_SIZE", "25");
        std::env::set_var("TRIALS__LOOKUP_TIMEOUT_SECS", "99");
        let s = Settings::load(Some(&path));
        std::env::remove_var("TRIALS_REGISTRY_PAGE_SIZE");
        std::env::remove_var("TRIALS__LOOKUP_TIMEOUT_SECS");

        let s = s.unwrap();
        assert_eq!(s.registry_page_size, 25);
        assert_eq!(s.lookup_timeout_secs, 4);
    }
}
