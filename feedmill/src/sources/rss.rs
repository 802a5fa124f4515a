use anyhow::{Context, Result};
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, SERVER};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{sanitize, FetchContext, FetchOutcome, FetchedItem};
use crate::httpclient;
use crate::store::SourceRow;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Fetch and parse an RSS/Atom source.
///
/// Performs a conditional GET using the etag/last-modified recorded on the
/// source row. Transient network errors and 5xx responses are retried with
/// exponential backoff; a Cloudflare challenge gets one extra attempt
/// through the browser-impersonation client.
pub async fn fetch(ctx: &FetchContext, source: &SourceRow) -> Result<FetchOutcome> {
    let client = httpclient::client(ctx.proxy.as_deref(), ctx.timeout_secs)?;

    let mut last_error = None;
    let mut use_browser_client = false;

    for attempt in 1..=MAX_ATTEMPTS {
        if attempt > 1 {
            let backoff = Duration::from_secs(2u64.pow(attempt - 2)).min(BACKOFF_CAP);
            info!(
                "retrying feed fetch for {} (attempt {}/{}) after {:?}",
                source.url, attempt, MAX_ATTEMPTS, backoff
            );
            tokio::time::sleep(backoff).await;
        }

        let client = if use_browser_client {
            httpclient::browser_client(ctx.proxy.as_deref(), ctx.timeout_secs)?
        } else {
            client.clone()
        };

        let mut req = client.get(&source.url);
        if let Some(etag) = &source.etag {
            req = req.header(IF_NONE_MATCH, etag);
        }
        if let Some(modified) = &source.last_modified {
            req = req.header(IF_MODIFIED_SINCE, modified);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status == StatusCode::NOT_MODIFIED {
                    debug!("feed {} not modified", source.url);
                    return Ok(FetchOutcome {
                        not_modified: true,
                        ..Default::default()
                    });
                }
                if status.is_success() {
                    let etag = header_string(&response, ETAG);
                    let last_modified = header_string(&response, LAST_MODIFIED);
                    let bytes = response.bytes().await.context("failed to read feed body")?;
                    let feed = feed_rs::parser::parse(bytes.as_ref())
                        .context("failed to parse feed")?;
                    return Ok(outcome_from_feed(feed, etag, last_modified));
                }
                if is_cloudflare_challenge(&response) && !use_browser_client {
                    warn!(
                        "feed {} returned a challenge ({}), retrying with browser client",
                        source.url, status
                    );
                    use_browser_client = true;
                    last_error = Some(anyhow::anyhow!("challenged with status {}", status));
                    continue;
                }
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    last_error = Some(anyhow::anyhow!("server error: {}", status));
                    continue;
                }
                // Client error (4xx): likely permanent, don't retry.
                return Err(anyhow::anyhow!("feed fetch failed with status: {}", status));
            }
            Err(e) => {
                last_error = Some(anyhow::Error::new(e).context("network error during fetch"));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("unknown error after retries")))
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn is_cloudflare_challenge(response: &reqwest::Response) -> bool {
    let status = response.status();
    if status != StatusCode::FORBIDDEN && status != StatusCode::SERVICE_UNAVAILABLE {
        return false;
    }
    response
        .headers()
        .get(SERVER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase().contains("cloudflare"))
        .unwrap_or(false)
        || response.headers().contains_key("cf-ray")
}

fn outcome_from_feed(
    feed: feed_rs::model::Feed,
    etag: Option<String>,
    last_modified: Option<String>,
) -> FetchOutcome {
    let feed_title = feed.title.as_ref().map(|t| t.content.clone());
    let items = feed.entries.iter().map(entry_to_item).collect();
    FetchOutcome {
        items,
        feed_title,
        etag,
        last_modified,
        ..Default::default()
    }
}

pub(crate) fn entry_to_item(entry: &feed_rs::model::Entry) -> FetchedItem {
    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .unwrap_or_default();
    let url = entry.links.first().map(|l| l.href.clone());

    let raw_content = entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()));

    let (content, media_urls) = match raw_content {
        Some(raw) => {
            let media = sanitize::collect_image_urls(&raw);
            (Some(sanitize::clean_html(&raw)), media)
        }
        None => (None, Vec::new()),
    };

    let author = entry
        .authors
        .first()
        .map(|p| p.name.clone())
        .filter(|n| !n.is_empty());

    FetchedItem {
        title,
        url,
        media_urls,
        author,
        published_at: entry.published.or(entry.updated),
        content,
        external_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RSS: &str = r#"<?xml version="1.0"?>
        <rss version="2.0"><channel>
            <title>Example</title>
            <item>
                <title>Hello</title>
                <link>https://example.com/hello</link>
                <description>&lt;p&gt;body&lt;/p&gt;&lt;script&gt;x()&lt;/script&gt;</description>
                <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate>
            </item>
            <item>
                <title>No date</title>
                <link>https://example.com/nodate</link>
            </item>
        </channel></rss>"#;

    #[test]
    fn parses_entries_and_scrubs_content() {
        let feed = feed_rs::parser::parse(SAMPLE_RSS.as_bytes()).expect("parse");
        let outcome = outcome_from_feed(feed, None, None);
        assert_eq!(outcome.feed_title.as_deref(), Some("Example"));
        assert_eq!(outcome.items.len(), 2);

        let first = &outcome.items[0];
        assert_eq!(first.title, "Hello");
        assert_eq!(first.url.as_deref(), Some("https://example.com/hello"));
        assert!(first.published_at.is_some());
        let body = first.content.as_deref().unwrap();
        assert!(body.contains("<p>body</p>"));
        assert!(!body.contains("script"));

        // Missing pubDate propagates as None so dedup uses the empty date.
        assert!(outcome.items[1].published_at.is_none());
    }
}
