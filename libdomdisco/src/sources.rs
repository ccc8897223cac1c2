use reqwest::Client;
use thiserror::Error;
use tracing::info;

pub const ROOT_ZONE_URL: &str = "https://www.internic.net/domain/root.zone";
pub const PUBLIC_SUFFIX_LIST_URL: &str = "https://publicsuffix.org/list/public_suffix_list.dat";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to fetch {url}: {source}")]
    Http {
        url: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

async fn fetch_text(client: &Client, url: &'static str) -> Result<String, FetchError> {
    let wrap = |source| FetchError::Http { url, source };

    let text = client
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(wrap)?
        .text()
        .await
        .map_err(wrap)?;

    info!(url, bytes = text.len(), "Fetched");
    Ok(text)
}

/// Downloads the IANA root zone file.
pub async fn fetch_root_zone(client: &Client) -> Result<String, FetchError> {
    fetch_text(client, ROOT_ZONE_URL).await
}

pub async fn fetch_public_suffix_list(client: &Client) -> Result<String, FetchError> {
    fetch_text(client, PUBLIC_SUFFIX_LIST_URL).await
}
