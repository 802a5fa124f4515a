use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{parse_params, sanitize, FetchContext, FetchOutcome, FetchedItem, ScriptParams};
use crate::store::SourceRow;

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Items as emitted by a user script on stdout (a JSON array).
#[derive(Debug, Deserialize)]
struct ScriptItem {
    title: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
}

/// Run a user script and parse its stdout as an item array.
///
/// The script path must resolve (canonically) under the configured scripts
/// root; anything else is rejected before execution.
pub async fn fetch(ctx: &FetchContext, source: &SourceRow) -> Result<FetchOutcome> {
    let params: ScriptParams = parse_params(source)?;

    let scripts_root = ctx
        .scripts_root
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no scripts root configured"))?;
    let script_path = validate_script_path(scripts_root, &params.path)?;

    debug!("running script source {}: {}", source.id, script_path.display());

    let output = tokio::time::timeout(SCRIPT_TIMEOUT, Command::new(&script_path).output())
        .await
        .map_err(|_| anyhow::anyhow!("script timed out after {:?}", SCRIPT_TIMEOUT))?
        .with_context(|| format!("failed to run script {}", script_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "script exited with {}: {}",
            output.status,
            stderr.chars().take(500).collect::<String>()
        );
    }

    let raw_items: Vec<ScriptItem> = serde_json::from_slice(&output.stdout)
        .context("script stdout is not a JSON array of items")?;

    let items = raw_items
        .into_iter()
        .filter(|i| !i.title.trim().is_empty())
        .map(|i| {
            let (content, media_urls) = match i.content {
                Some(raw) => {
                    let media = sanitize::collect_image_urls(&raw);
                    (Some(sanitize::clean_html(&raw)), media)
                }
                None => (None, Vec::new()),
            };
            FetchedItem {
                title: i.title,
                url: i.url,
                media_urls,
                author: i.author,
                published_at: i.published_at,
                content,
                external_id: None,
            }
        })
        .collect();

    Ok(FetchOutcome {
        items,
        ..Default::default()
    })
}

/// Canonicalize and check containment under the scripts root. Symlinks that
/// escape the root are rejected by the canonical comparison.
fn validate_script_path(root: &Path, requested: &str) -> Result<std::path::PathBuf> {
    let root = root
        .canonicalize()
        .with_context(|| format!("scripts root {} does not exist", root.display()))?;
    let candidate = if Path::new(requested).is_absolute() {
        Path::new(requested).to_path_buf()
    } else {
        root.join(requested)
    };
    let resolved = candidate
        .canonicalize()
        .with_context(|| format!("script {} does not exist", candidate.display()))?;
    if !resolved.starts_with(&root) {
        anyhow::bail!(
            "script path {} escapes the scripts root",
            resolved.display()
        );
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("scripts");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("ok.sh"), "#!/bin/sh\necho []\n").unwrap();
        let outside = dir.path().join("evil.sh");
        std::fs::write(&outside, "#!/bin/sh\n").unwrap();

        assert!(validate_script_path(&root, "ok.sh").is_ok());
        assert!(validate_script_path(&root, "../evil.sh").is_err());
        assert!(validate_script_path(&root, outside.to_str().unwrap()).is_err());
        assert!(validate_script_path(&root, "missing.sh").is_err());
    }

    #[test]
    fn parses_script_items() {
        let raw = r#"[
            {"title": "A", "url": "https://x/1", "published_at": "2024-01-01T00:00:00Z"},
            {"title": "B", "content": "<p>hi</p><script>x</script>"}
        ]"#;
        let items: Vec<ScriptItem> = serde_json::from_str(raw).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].published_at.is_some());
        assert!(items[1].published_at.is_none());
    }
}
