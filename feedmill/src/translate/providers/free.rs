use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{classify_reqwest, classify_status, Translator};
use crate::error::{Error, Result};
use crate::httpclient;

const TIMEOUT_SECS: u64 = 30;
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Free public translate endpoint: a GET returning a nested-array payload
/// whose first level holds [translated, original, ...] sentence tuples.
pub struct FreeTranslator {
    endpoint: String,
    proxy: Option<String>,
}

impl FreeTranslator {
    pub fn new(endpoint: impl Into<String>, proxy: Option<String>) -> Self {
        FreeTranslator {
            endpoint: endpoint.into(),
            proxy,
        }
    }

    /// This provider wants region-qualified Chinese.
    fn remap_lang(code: &str) -> &str {
        match code {
            "zh" => "zh-CN",
            other => other,
        }
    }
}

#[async_trait]
impl Translator for FreeTranslator {
    fn kind(&self) -> &'static str {
        "free"
    }

    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        source_lang: Option<&str>,
    ) -> Result<String> {
        let client = httpclient::client(self.proxy.as_deref(), TIMEOUT_SECS)?;
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                let backoff = Duration::from_secs(5 * 2u64.pow(attempt - 2)).min(BACKOFF_CAP);
                debug!("free translate retry {}/{} after {:?}", attempt, MAX_ATTEMPTS, backoff);
                tokio::time::sleep(backoff).await;
            }

            let result = client
                .get(&self.endpoint)
                .query(&[
                    ("client", "gtx"),
                    ("sl", source_lang.unwrap_or("auto")),
                    ("tl", Self::remap_lang(target_lang)),
                    ("dt", "t"),
                    ("q", text),
                ])
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    let raw = response.text().await.map_err(classify_reqwest)?;
                    if !status.is_success() {
                        let err = classify_status(status, &raw);
                        if matches!(err, Error::ProviderRejected(_)) {
                            return Err(err);
                        }
                        last_err = Some(err);
                        continue;
                    }
                    return parse_nested_payload(&raw).ok_or_else(|| {
                        Error::ProviderFormatUnknown("free translate payload did not parse".into())
                    });
                }
                Err(e) => {
                    last_err = Some(classify_reqwest(e));
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::ProviderUnreachable("free translate failed".into())))
    }
}

/// Payload shape: `[[["translated","original",...], ...], ...]` — the
/// translation is the concatenation of each tuple's first element.
fn parse_nested_payload(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let sentences = value.get(0)?.as_array()?;
    let mut out = String::new();
    for tuple in sentences {
        if let Some(piece) = tuple.get(0).and_then(Value::as_str) {
            out.push_str(piece);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_arrays() {
        let raw = r#"[[["Bonjour ","Hello ",null],["le monde","world",null]],null,"en"]"#;
        assert_eq!(
            parse_nested_payload(raw),
            Some("Bonjour le monde".to_string())
        );
        assert_eq!(parse_nested_payload("{}"), None);
        assert_eq!(parse_nested_payload("not json"), None);
    }

    #[test]
    fn chinese_is_region_qualified() {
        assert_eq!(FreeTranslator::remap_lang("zh"), "zh-CN");
        assert_eq!(FreeTranslator::remap_lang("fr"), "fr");
    }

    #[tokio::test]
    async fn end_to_end_against_mock() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"[[["Bonjour","Hello",null]],null,"en"]"#)
            .create_async()
            .await;

        let provider = FreeTranslator::new(server.url(), None);
        let out = provider.translate("Hello", "fr", None).await.unwrap();
        assert_eq!(out, "Bonjour");
    }
}
