use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use super::{classify_reqwest, classify_status, Translator};
use crate::error::{Error, Result};
use crate::httpclient;

const TIMEOUT_SECS: u64 = 30;

/// User-authored HTTP translation endpoint: method, headers and body are
/// templated with `{{text}}`, `{{target_lang}}` and `{{source_lang}}`
/// placeholders; the result is extracted by a dotted JSON path.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub endpoint: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body_template: Option<String>,
    /// e.g. "data.translations.0.text"
    pub response_path: String,
    /// Per-endpoint language-code remap, applied before substitution.
    #[serde(default)]
    pub lang_map: HashMap<String, String>,
}

fn default_method() -> String {
    "POST".to_string()
}

pub struct CustomTranslator {
    config: CustomConfig,
    proxy: Option<String>,
}

impl CustomTranslator {
    pub fn new(config: CustomConfig, proxy: Option<String>) -> Self {
        CustomTranslator { config, proxy }
    }
}

fn substitute(template: &str, text: &str, target: &str, source: &str, json_escape: bool) -> String {
    let text = if json_escape {
        // Escape for embedding inside a JSON string literal.
        let quoted = serde_json::to_string(text).unwrap_or_default();
        quoted[1..quoted.len() - 1].to_string()
    } else {
        text.to_string()
    };
    template
        .replace("{{text}}", &text)
        .replace("{{target_lang}}", target)
        .replace("{{source_lang}}", source)
}

/// Walk a dotted path through a JSON value; numeric components index arrays.
fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = value;
    for part in path.split('.') {
        cur = match part.parse::<usize>() {
            Ok(idx) => cur.get(idx)?,
            Err(_) => cur.get(part)?,
        };
    }
    Some(cur)
}

#[async_trait]
impl Translator for CustomTranslator {
    fn kind(&self) -> &'static str {
        "custom"
    }

    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        source_lang: Option<&str>,
    ) -> Result<String> {
        let client = httpclient::client(self.proxy.as_deref(), TIMEOUT_SECS)?;

        let target = self
            .config
            .lang_map
            .get(target_lang)
            .map(String::as_str)
            .unwrap_or(target_lang);
        let source = source_lang.unwrap_or("auto");

        let url = substitute(&self.config.endpoint, text, target, source, false);
        let method = self.config.method.to_uppercase();
        let mut req = match method.as_str() {
            "GET" => client.get(&url),
            "POST" => client.post(&url),
            "PUT" => client.put(&url),
            other => {
                return Err(Error::InvalidInput(format!(
                    "unsupported method '{}' in custom translator",
                    other
                )))
            }
        };

        for (name, value) in &self.config.headers {
            req = req.header(
                name.as_str(),
                substitute(value, text, target, source, false),
            );
        }
        if let Some(template) = &self.config.body_template {
            let body = substitute(template, text, target, source, true);
            req = req
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = req.send().await.map_err(classify_reqwest)?;
        let status = response.status();
        let raw = response.text().await.map_err(classify_reqwest)?;
        if !status.is_success() {
            return Err(classify_status(status, &raw));
        }

        let value: Value = serde_json::from_str(&raw)
            .map_err(|_| Error::ProviderFormatUnknown("custom endpoint returned non-JSON".into()))?;
        extract_path(&value, &self.config.response_path)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::ProviderFormatUnknown(format!(
                    "path '{}' not found in custom response",
                    self.config.response_path
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_and_json_escaping() {
        let out = substitute(
            r#"{"q":"{{text}}","to":"{{target_lang}}"}"#,
            "he said \"hi\"",
            "fr",
            "auto",
            true,
        );
        assert_eq!(out, r#"{"q":"he said \"hi\"","to":"fr"}"#);
        // The escaped body must itself be valid JSON.
        assert!(serde_json::from_str::<Value>(&out).is_ok());
    }

    #[test]
    fn dotted_path_extraction() {
        let value: Value = serde_json::from_str(
            r#"{"data":{"translations":[{"text":"salut"},{"text":"ignored"}]}}"#,
        )
        .unwrap();
        assert_eq!(
            extract_path(&value, "data.translations.0.text").and_then(Value::as_str),
            Some("salut")
        );
        assert!(extract_path(&value, "data.missing").is_none());
    }

    #[tokio::test]
    async fn lang_map_and_request_shape() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/translate")
            .match_body(mockito::Matcher::JsonString(
                r#"{"q":"hello","to":"zh-CN"}"#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"result":{"text":"你好"}}"#)
            .create_async()
            .await;

        let config = CustomConfig {
            method: "POST".to_string(),
            endpoint: format!("{}/translate", server.url()),
            headers: HashMap::new(),
            body_template: Some(r#"{"q":"{{text}}","to":"{{target_lang}}"}"#.to_string()),
            response_path: "result.text".to_string(),
            lang_map: HashMap::from([("zh".to_string(), "zh-CN".to_string())]),
        };
        let provider = CustomTranslator::new(config, None);
        let out = provider.translate("hello", "zh", None).await.unwrap();
        assert_eq!(out, "你好");
        m.assert_async().await;
    }
}
