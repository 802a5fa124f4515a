use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sxd_document::Package;
use sxd_xpath::nodeset::Node;
use sxd_xpath::{Context as XpathContext, Factory, Value};
use tracing::debug;

use super::{parse_params, sanitize, FetchContext, FetchOutcome, FetchedItem, XpathParams};
use crate::httpclient;
use crate::store::SourceRow;

/// Scrape an arbitrary page with the source's stored XPath selectors.
///
/// An empty item selector means the source is misconfigured; the error is
/// recorded on the source row by the fetcher like any other failure.
pub async fn fetch(ctx: &FetchContext, source: &SourceRow) -> Result<FetchOutcome> {
    let params: XpathParams = parse_params(source)?;
    if params.item.trim().is_empty() {
        anyhow::bail!("XPath source has an empty item selector");
    }

    let client = httpclient::client(ctx.proxy.as_deref(), ctx.timeout_secs)?;
    let response = client
        .get(&source.url)
        .send()
        .await
        .context("failed to fetch page")?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("page fetch failed with status: {}", status);
    }
    let body = response.text().await.context("failed to read page body")?;

    let package = sxd_document::parser::parse(&body)
        .map_err(|e| anyhow::anyhow!("page is not parseable markup: {:?}", e))?;

    let items = extract_items(&package, &params)?;
    debug!("xpath source {} extracted {} items", source.id, items.len());

    Ok(FetchOutcome {
        items,
        ..Default::default()
    })
}

fn extract_items(package: &Package, params: &XpathParams) -> Result<Vec<FetchedItem>> {
    let document = package.as_document();
    let factory = Factory::new();
    let context = XpathContext::new();

    let item_xpath = factory
        .build(&params.item)
        .map_err(|e| anyhow::anyhow!("invalid item selector: {}", e))?
        .ok_or_else(|| anyhow::anyhow!("empty item selector"))?;

    let value = item_xpath
        .evaluate(&context, document.root())
        .map_err(|e| anyhow::anyhow!("item selector failed: {}", e))?;

    let nodes = match value {
        Value::Nodeset(ns) => ns.document_order(),
        _ => anyhow::bail!("item selector did not select nodes"),
    };

    let mut items = Vec::with_capacity(nodes.len());
    for node in nodes {
        let title = eval_string(&factory, &context, params.title.as_deref(), node)?
            .unwrap_or_default();
        if title.trim().is_empty() {
            continue;
        }
        let url = eval_string(&factory, &context, params.link.as_deref(), node)?;
        let content = eval_string(&factory, &context, params.content.as_deref(), node)?;
        let author = eval_string(&factory, &context, params.author.as_deref(), node)?;
        let published_at = eval_string(&factory, &context, params.time.as_deref(), node)?
            .and_then(|raw| parse_timestamp(&raw));

        let (content, media_urls) = match content {
            Some(raw) => {
                let media = sanitize::collect_image_urls(&raw);
                (Some(sanitize::clean_html(&raw)), media)
            }
            None => (None, Vec::new()),
        };

        items.push(FetchedItem {
            title: title.trim().to_string(),
            url,
            media_urls,
            author,
            published_at,
            content,
            external_id: None,
        });
    }
    Ok(items)
}

fn eval_string(
    factory: &Factory,
    context: &XpathContext,
    selector: Option<&str>,
    node: Node,
) -> Result<Option<String>> {
    let Some(selector) = selector.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    let xpath = factory
        .build(selector)
        .map_err(|e| anyhow::anyhow!("invalid selector '{}': {}", selector, e))?
        .ok_or_else(|| anyhow::anyhow!("empty selector"))?;
    let value = xpath
        .evaluate(context, node)
        .map_err(|e| anyhow::anyhow!("selector '{}' failed: {}", selector, e))?;
    let text = value.string();
    if text.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

/// Timestamps on scraped pages are wild; try the formats that actually occur.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let naive = date.and_hms_opt(0, 0, 0)?;
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
        <div class="post"><h2>First post</h2><a href="https://example.com/1">read</a>
            <span>2024-01-02</span><p>Body one</p></div>
        <div class="post"><h2>Second post</h2><a href="https://example.com/2">read</a>
            <span>2024-01-03</span><p>Body two</p></div>
    </body></html>"#;

    fn params() -> XpathParams {
        XpathParams {
            item: "//div[@class='post']".to_string(),
            title: Some("h2".to_string()),
            link: Some("a/@href".to_string()),
            content: Some("p".to_string()),
            time: Some("span".to_string()),
            author: None,
            category: None,
        }
    }

    #[test]
    fn extracts_items_with_relative_selectors() {
        let package = sxd_document::parser::parse(PAGE).expect("parse page");
        let items = extract_items(&package, &params()).expect("extract");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "First post");
        assert_eq!(items[0].url.as_deref(), Some("https://example.com/1"));
        assert!(items[0].published_at.is_some());
        assert!(items[0].content.as_deref().unwrap().contains("Body one"));
    }

    #[test]
    fn timestamp_formats() {
        assert!(parse_timestamp("2024-01-02T10:00:00Z").is_some());
        assert!(parse_timestamp("Mon, 01 Jan 2024 10:00:00 GMT").is_some());
        assert!(parse_timestamp("2024-01-02").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
