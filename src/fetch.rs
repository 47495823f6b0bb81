use std::future::Future;
use std::time::Duration;

use reqwest::header::{ACCEPT, USER_AGENT};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::FetchError;

const AGENT: &str = concat!("trial_matcher/", env!("CARGO_PKG_VERSION"));

/// The only place the pipeline touches the network. Components take a
/// `&impl Fetch` so tests can swap in canned pages.
pub trait Fetch: Sync {
    /// GET `url` and return the body. `timeout` overrides the fetcher's
    /// default for this one request.
    fn fetch(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<String, FetchError>> + Send;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    max_retries: u32,
    base_backoff: Duration,
}

impl HttpFetcher {
    pub fn new(settings: &Settings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .connect_timeout(settings.request_timeout())
            .build()?;
        Ok(HttpFetcher {
            client,
            max_retries: settings.max_retries,
            base_backoff: settings.base_backoff(),
        })
    }

    async fn fetch_once(&self, url: &str, timeout: Option<Duration>) -> Result<String, FetchError> {
        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, AGENT)
            .header(ACCEPT, "text/html,application/json;q=0.9,*/*;q=0.8");
        if let Some(t) = timeout {
            request = request.timeout(t);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Option<Duration>) -> Result<String, FetchError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url, timeout).await {
                Ok(body) => {
                    debug!(url = %url, bytes = body.len(), "fetched");
                    return Ok(body);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let backoff = backoff_delay(self.base_backoff, attempt);
                    warn!(
                        "Fetch of {} failed (attempt {}/{}): {}; backing off {:.1}s",
                        url,
                        attempt + 1,
                        self.max_retries,
                        e,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Exponential backoff: `base * 2^attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::Fetch;
    use crate::error::FetchError;

    /// Serves canned bodies by exact URL; anything else is a 404.
    #[derive(Default)]
    pub struct StaticFetcher {
        pages: HashMap<String, String>,
        requests: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.to_string());
            self
        }

        pub fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Fetch for StaticFetcher {
        async fn fetch(&self, url: &str, _timeout: Option<Duration>) -> Result<String, FetchError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.pages.get(url).cloned().ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
        }
    }
}
