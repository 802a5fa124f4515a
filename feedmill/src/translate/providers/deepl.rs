use async_trait::async_trait;
use serde::Deserialize;

use super::{classify_reqwest, classify_status, Translator};
use crate::error::{Error, Result};
use crate::httpclient;

const TIMEOUT_SECS: u64 = 30;
const PAID_ENDPOINT: &str = "https://api.deepl.com/v2/translate";
const FREE_ENDPOINT: &str = "https://api-free.deepl.com/v2/translate";

/// Commercial form-encoded translation API. Keys ending in `:fx` belong to
/// the free tier and route to its dedicated host.
pub struct DeeplTranslator {
    auth_key: String,
    endpoint: String,
    proxy: Option<String>,
}

impl DeeplTranslator {
    pub fn new(auth_key: impl Into<String>, proxy: Option<String>) -> Self {
        let auth_key = auth_key.into();
        let endpoint = if auth_key.ends_with(":fx") {
            FREE_ENDPOINT
        } else {
            PAID_ENDPOINT
        }
        .to_string();
        DeeplTranslator {
            auth_key,
            endpoint,
            proxy,
        }
    }

    #[cfg(test)]
    fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// This API wants upper-case codes and bare `ZH`.
    fn remap_lang(code: &str) -> String {
        code.split(['-', '_'])
            .next()
            .unwrap_or(code)
            .to_uppercase()
    }
}

#[derive(Deserialize)]
struct DeeplResponse {
    translations: Vec<DeeplTranslation>,
}

#[derive(Deserialize)]
struct DeeplTranslation {
    text: String,
}

#[async_trait]
impl Translator for DeeplTranslator {
    fn kind(&self) -> &'static str {
        "deepl"
    }

    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        source_lang: Option<&str>,
    ) -> Result<String> {
        let client = httpclient::client(self.proxy.as_deref(), TIMEOUT_SECS)?;

        let target = Self::remap_lang(target_lang);
        let mut form: Vec<(&str, String)> = vec![
            ("auth_key", self.auth_key.clone()),
            ("text", text.to_string()),
            ("target_lang", target),
        ];
        if let Some(src) = source_lang {
            form.push(("source_lang", Self::remap_lang(src)));
        }

        let response = client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .map_err(classify_reqwest)?;
        let status = response.status();
        let raw = response.text().await.map_err(classify_reqwest)?;
        if !status.is_success() {
            return Err(classify_status(status, &raw));
        }

        let parsed: DeeplResponse = serde_json::from_str(&raw)
            .map_err(|_| Error::ProviderFormatUnknown("deepl payload did not parse".into()))?;
        parsed
            .translations
            .into_iter()
            .next()
            .map(|t| t.text)
            .ok_or_else(|| Error::ProviderFormatUnknown("deepl returned no translations".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_tier_keys_route_to_free_host() {
        let free = DeeplTranslator::new("abc123:fx", None);
        assert_eq!(free.endpoint, FREE_ENDPOINT);
        let paid = DeeplTranslator::new("abc123", None);
        assert_eq!(paid.endpoint, PAID_ENDPOINT);
    }

    #[test]
    fn lang_codes_are_uppercased_and_stripped() {
        assert_eq!(DeeplTranslator::remap_lang("zh-CN"), "ZH");
        assert_eq!(DeeplTranslator::remap_lang("en"), "EN");
    }

    #[tokio::test]
    async fn parses_translations_array() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v2/translate")
            .with_status(200)
            .with_body(r#"{"translations":[{"detected_source_language":"EN","text":"Hallo"}]}"#)
            .create_async()
            .await;

        let provider = DeeplTranslator::new("k:fx", None)
            .with_endpoint(format!("{}/v2/translate", server.url()));
        let out = provider.translate("Hello", "de", None).await.unwrap();
        assert_eq!(out, "Hallo");
    }

    #[tokio::test]
    async fn rejection_is_classified() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v2/translate")
            .with_status(403)
            .with_body("bad key")
            .create_async()
            .await;

        let provider =
            DeeplTranslator::new("k", None).with_endpoint(format!("{}/v2/translate", server.url()));
        let err = provider.translate("Hello", "de", None).await.unwrap_err();
        assert!(matches!(err, Error::ProviderRejected(_)));
    }
}
