/*!
Translation providers. The orchestrator walks a fallback chain of these;
network failures and 4xx rejections advance the chain, an unparseable
response shape is fatal for the call.
*/

use crate::error::{Error, Result};

pub mod ai;
pub mod custom;
pub mod deepl;
pub mod free;

/// Common contract: translate one piece of text into the target language.
///
/// Each provider keeps its own language-code remap; there is deliberately
/// no global normalization layer (the free provider wants `zh-CN`, the AI
/// prompt spells out "Simplified Chinese", DeepL wants `ZH`).
#[async_trait::async_trait]
pub trait Translator: Send + Sync {
    /// Stable name used as the cache key component.
    fn kind(&self) -> &'static str;

    /// AI providers pass through the rate limiter and usage accounting.
    fn is_ai(&self) -> bool {
        false
    }

    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        source_lang: Option<&str>,
    ) -> Result<String>;
}

/// Map a reqwest error onto the provider taxonomy.
pub(crate) fn classify_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        Error::ProviderUnreachable(e.to_string())
    } else {
        Error::Internal(anyhow::anyhow!(e))
    }
}

/// Map a non-success status onto the provider taxonomy.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> Error {
    let snippet: String = body.chars().take(200).collect();
    if status.is_client_error() {
        Error::ProviderRejected(format!("{}: {}", status, snippet))
    } else {
        Error::ProviderUnreachable(format!("{}: {}", status, snippet))
    }
}
