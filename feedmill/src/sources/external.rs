use anyhow::Result;
use tracing::debug;

use super::{parse_params, sanitize, ExternalParams, FetchContext, FetchOutcome, FetchedItem};
use crate::store::SourceRow;
use crate::sync::greader::{GReaderClient, RemoteItem};

const PULL_LIMIT: u32 = 100;

/// Pull unread items from the user's FreshRSS-compatible aggregator for
/// one configured stream. Items carry the remote id in `external_id` so
/// flag changes can be written back.
pub async fn fetch(ctx: &FetchContext, source: &SourceRow) -> Result<FetchOutcome> {
    let params: ExternalParams = parse_params(source)?;
    let config = ctx
        .aggregator
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no external aggregator configured"))?;

    let mut client = GReaderClient::new(config);
    let remote = client
        .stream_contents(&params.stream_id, true, PULL_LIMIT)
        .await?;

    debug!(
        "external source {}: {} unread items from stream {}",
        source.id,
        remote.len(),
        params.stream_id
    );

    let items = remote.iter().map(remote_to_item).collect();
    Ok(FetchOutcome {
        items,
        ..Default::default()
    })
}

pub(crate) fn remote_to_item(remote: &RemoteItem) -> FetchedItem {
    let content = remote
        .summary
        .as_ref()
        .and_then(|s| s.content.as_deref())
        .map(sanitize::clean_html);
    let media_urls = content
        .as_deref()
        .map(sanitize::collect_image_urls)
        .unwrap_or_default();

    FetchedItem {
        title: remote.title.clone().unwrap_or_default(),
        url: remote.link().map(str::to_string),
        media_urls,
        author: remote.author.clone(),
        published_at: remote
            .published
            .and_then(|epoch| chrono::DateTime::from_timestamp(epoch, 0)),
        content,
        external_id: Some(remote.id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::greader::{RemoteLink, RemoteSummary};

    #[test]
    fn remote_items_keep_their_external_id() {
        let remote = RemoteItem {
            id: "tag:google.com,2005:reader/item/00000001".to_string(),
            title: Some("Remote".to_string()),
            published: Some(1_704_103_200),
            author: None,
            canonical: vec![RemoteLink {
                href: "https://example.com/1".to_string(),
            }],
            alternate: vec![],
            summary: Some(RemoteSummary {
                content: Some("<p>hi</p>".to_string()),
            }),
            categories: vec![],
        };
        let item = remote_to_item(&remote);
        assert_eq!(
            item.external_id.as_deref(),
            Some("tag:google.com,2005:reader/item/00000001")
        );
        assert!(item.published_at.is_some());
        assert_eq!(item.url.as_deref(), Some("https://example.com/1"));
    }
}
