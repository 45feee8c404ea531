use scraper::{Html, Selector};
use std::time::Duration;
use url::Url;

use super::fetcher::{fetch_bytes, FetchError};

const MAX_PAGE_SIZE: usize = 5 * 1024 * 1024; // 5MB

const OG_IMAGE_SELECTOR: &str = r#"meta[property="og:image"]"#;

/// Fetch an article page and return its `og:image` URL.
///
/// Returns `Ok(None)` when the page loads but carries no usable `og:image`
/// tag; only transport and HTTP status problems are errors.
///
/// # Errors
///
/// Any [`FetchError`] from retrieving the page: network failure, non-2xx
/// status, `timeout` elapsed or a body over 5MB.
pub async fn resolve_image(
    client: &reqwest::Client,
    article_url: &str,
    timeout: Duration,
) -> Result<Option<String>, FetchError> {
    let bytes = fetch_bytes(client, article_url, timeout, MAX_PAGE_SIZE).await?;
    let html = String::from_utf8_lossy(&bytes);

    let image = extract_og_image(&html, article_url);
    if image.is_none() {
        tracing::debug!(url = %article_url, "Article page has no og:image");
    }
    Ok(image)
}

/// Pull the `content` of the first non-blank `og:image` meta tag out of
/// `html`.
///
/// Relative values are resolved against `page_url`; if that cannot be
/// parsed the raw value is returned as-is.
pub fn extract_og_image(html: &str, page_url: &str) -> Option<String> {
    let selector = Selector::parse(OG_IMAGE_SELECTOR).ok()?;
    let document = Html::parse_document(html);

    let content = document
        .select(&selector)
        .filter_map(|element| element.value().attr("content"))
        .map(str::trim)
        .find(|content| !content.is_empty())?;

    match Url::parse(page_url).and_then(|base| base.join(content)) {
        Ok(resolved) => Some(resolved.to_string()),
        Err(_) => Some(content.to_string()),
    }
}
