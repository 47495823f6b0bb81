use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use tracing::{info, warn};
use url::Url;

use crate::error::FetchError;
use crate::fetch::Fetch;

static ENTRY: LazyLock<Selector> = LazyLock::new(|| Selector::parse(".inside-article").unwrap());
static READ_MORE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.btn-login.btn-xs").unwrap());
static NEXT_PAGE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.next.page-numbers").unwrap());

/// What one listing page yields: the detail links in page order and the
/// target of the "next page" control, if any.
#[derive(Debug, Default, PartialEq)]
pub struct ListingPage {
    pub links: Vec<String>,
    pub next: Option<String>,
}

pub fn parse_listing_page(html: &str, page_url: &str) -> ListingPage {
    let doc = Html::parse_document(html);
    let base = Url::parse(page_url).ok();

    let links = doc
        .select(&ENTRY)
        .filter_map(|entry| entry.select(&READ_MORE).next())
        .filter_map(|a| a.value().attr("href"))
        .map(|href| resolve(base.as_ref(), href))
        .collect();

    let next = doc
        .select(&NEXT_PAGE)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(|href| resolve(base.as_ref(), href));

    ListingPage { links, next }
}

fn resolve(base: Option<&Url>, href: &str) -> String {
    base.and_then(|b| b.join(href).ok())
        .map(String::from)
        .unwrap_or_else(|| href.to_string())
}

/// Walk the paginated listing from `base_url` and return every detail link in
/// encounter order. A fetch failure aborts the walk. A page seen twice or
/// more than `max_pages` pages ends it early with what was gathered.
pub async fn collect_trial_links<F: Fetch>(
    fetcher: &F,
    base_url: &str,
    max_pages: usize,
) -> Result<Vec<String>, FetchError> {
    let mut links = Vec::new();
    let mut visited = HashSet::new();
    let mut current = Some(base_url.to_string());

    while let Some(page_url) = current.take() {
        if !visited.insert(page_url.clone()) {
            warn!(url = %page_url, "Pagination loops back to a visited page, stopping");
            break;
        }
        if visited.len() > max_pages {
            warn!(max_pages, "Page limit reached, stopping crawl");
            break;
        }

        info!(url = %page_url, "Scraping listing page");
        let html = fetcher.fetch(&page_url, None).await?;
        let page = parse_listing_page(&html, &page_url);
        links.extend(page.links);
        current = page.next;
    }

    info!(count = links.len(), "Collected trial links");
    Ok(links)
}
