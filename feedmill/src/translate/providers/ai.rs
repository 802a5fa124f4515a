use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{classify_reqwest, classify_status, Translator};
use crate::error::{Error, Result};
use crate::httpclient;

const CALL_TIMEOUT: Duration = Duration::from_secs(60);
const TOTAL_BUDGET: Duration = Duration::from_secs(120);

/// Chat-completion translation provider.
///
/// Different endpoints speak different dialects; rather than configure one,
/// the provider autodetects across five response families, cycling on
/// failure until one parses or the total budget runs out.
pub struct AiTranslator {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    custom_headers: Vec<(String, String)>,
    proxy: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Chat,
    Thinking,
    Streaming,
    Responses,
    OllamaGenerate,
}

const FAMILIES: [Family; 5] = [
    Family::Chat,
    Family::Thinking,
    Family::Streaming,
    Family::Responses,
    Family::OllamaGenerate,
];

impl AiTranslator {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        custom_headers: Vec<(String, String)>,
        proxy: Option<String>,
    ) -> Self {
        AiTranslator {
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
            custom_headers,
            proxy,
        }
    }

    fn prompt(text: &str, target_lang: &str, source_lang: Option<&str>) -> (String, String) {
        let system = format!(
            "You are a translation engine. Translate the user's text into {}. \
             Preserve markdown structure, inline code and link targets exactly. \
             Output only the translation, nothing else.",
            language_name(target_lang)
        );
        let user = match source_lang {
            Some(src) => format!("[source language: {}]\n{}", language_name(src), text),
            None => text.to_string(),
        };
        (system, user)
    }

    async fn attempt(
        &self,
        family: Family,
        system: &str,
        user: &str,
    ) -> Result<String> {
        let client = httpclient::client(self.proxy.as_deref(), CALL_TIMEOUT.as_secs())?;

        let (url, body) = match family {
            Family::Chat | Family::Thinking => (
                self.endpoint.clone(),
                json!({
                    "model": self.model,
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": user},
                    ],
                    "stream": false,
                }),
            ),
            Family::Streaming => (
                self.endpoint.clone(),
                json!({
                    "model": self.model,
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": user},
                    ],
                    "stream": true,
                }),
            ),
            Family::Responses => (
                self.endpoint.clone(),
                json!({
                    "model": self.model,
                    "input": format!("{}\n\n{}", system, user),
                }),
            ),
            Family::OllamaGenerate => (
                generate_url(&self.endpoint),
                json!({
                    "model": self.model,
                    "prompt": format!("{}\n\n{}", system, user),
                    "stream": false,
                }),
            ),
        };

        let mut req = client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        for (name, value) in &self.custom_headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let response = req.send().await.map_err(classify_reqwest)?;
        let status = response.status();
        let raw = response.text().await.map_err(classify_reqwest)?;
        if !status.is_success() {
            return Err(classify_status(status, &raw));
        }

        parse_family(family, &raw)
            .ok_or_else(|| Error::ProviderFormatUnknown(format!("{:?} did not parse", family)))
    }
}

impl AiTranslator {
    /// Run a raw (system, user) instruction through the family
    /// autodetection loop. Translation and summarization both land here.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let started = Instant::now();
        let mut last_err = None;

        for family in FAMILIES {
            if started.elapsed() >= TOTAL_BUDGET {
                debug!("AI translate total budget exhausted");
                break;
            }
            match self.attempt(family, system, user).await {
                Ok(out) => {
                    let out = out.trim().to_string();
                    if !out.is_empty() {
                        return Ok(out);
                    }
                    last_err = Some(Error::ProviderFormatUnknown(format!(
                        "{:?} returned empty output",
                        family
                    )));
                }
                // A dead endpoint will be dead for every family; bail out.
                Err(Error::ProviderUnreachable(msg)) => {
                    return Err(Error::ProviderUnreachable(msg));
                }
                Err(e) => {
                    warn!("AI response family {:?} failed: {}", family, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::ProviderFormatUnknown("no response family parsed".into())))
    }
}

#[async_trait]
impl Translator for AiTranslator {
    fn kind(&self) -> &'static str {
        "ai"
    }

    fn is_ai(&self) -> bool {
        true
    }

    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        source_lang: Option<&str>,
    ) -> Result<String> {
        let (system, user) = Self::prompt(text, target_lang, source_lang);
        self.complete(&system, &user).await
    }
}

/// Derive an ollama-style generate URL from a chat-completions endpoint.
fn generate_url(endpoint: &str) -> String {
    if endpoint.contains("/v1/chat/completions") {
        endpoint.replace("/v1/chat/completions", "/api/generate")
    } else if endpoint.ends_with("/chat/completions") {
        endpoint.replace("/chat/completions", "/generate")
    } else {
        format!("{}/api/generate", endpoint.trim_end_matches('/'))
    }
}

fn parse_family(family: Family, raw: &str) -> Option<String> {
    match family {
        Family::Chat => parse_chat(raw),
        Family::Thinking => parse_thinking(raw),
        Family::Streaming => parse_stream(raw),
        Family::Responses => parse_responses(raw),
        Family::OllamaGenerate => parse_generate(raw),
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

fn parse_chat(raw: &str) -> Option<String> {
    let parsed: ChatResponse = serde_json::from_str(raw).ok()?;
    parsed.choices.first()?.message.content.clone().filter(|c| !c.is_empty())
}

/// Thinking-enabled endpoints interleave reasoning with the answer; the
/// answer is `content` with any `<think>` block stripped.
fn parse_thinking(raw: &str) -> Option<String> {
    let parsed: ChatResponse = serde_json::from_str(raw).ok()?;
    let message = &parsed.choices.first()?.message;
    let content = message.content.clone().or_else(|| message.reasoning_content.clone())?;
    Some(strip_think_block(&content))
}

fn strip_think_block(content: &str) -> String {
    match (content.find("<think>"), content.find("</think>")) {
        (Some(start), Some(end)) if end > start => {
            let mut out = String::new();
            out.push_str(&content[..start]);
            out.push_str(&content[end + "</think>".len()..]);
            out.trim().to_string()
        }
        _ => content.trim().to_string(),
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Server-sent events with `data:` lines of delta chunks.
fn parse_stream(raw: &str) -> Option<String> {
    let mut out = String::new();
    let mut saw_chunk = false;
    for line in raw.lines() {
        let Some(data) = line.strip_prefix("data:") else { continue };
        let data = data.trim();
        if data == "[DONE]" {
            continue;
        }
        if let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) {
            saw_chunk = true;
            if let Some(content) = chunk
                .choices
                .first()
                .and_then(|c| c.delta.as_ref())
                .and_then(|d| d.content.as_ref())
            {
                out.push_str(content);
            }
        }
    }
    if saw_chunk && !out.is_empty() {
        Some(out)
    } else {
        None
    }
}

#[derive(Deserialize)]
struct ResponsesBody {
    #[serde(default)]
    output_text: Option<String>,
    #[serde(default)]
    output: Vec<ResponsesOutput>,
}

#[derive(Deserialize)]
struct ResponsesOutput {
    #[serde(default)]
    content: Vec<ResponsesContent>,
}

#[derive(Deserialize)]
struct ResponsesContent {
    #[serde(default)]
    text: Option<String>,
}

fn parse_responses(raw: &str) -> Option<String> {
    let parsed: ResponsesBody = serde_json::from_str(raw).ok()?;
    if let Some(text) = parsed.output_text.filter(|t| !t.is_empty()) {
        return Some(text);
    }
    parsed
        .output
        .iter()
        .flat_map(|o| o.content.iter())
        .find_map(|c| c.text.clone())
        .filter(|t| !t.is_empty())
}

#[derive(Deserialize)]
struct GenerateBody {
    response: String,
}

fn parse_generate(raw: &str) -> Option<String> {
    let parsed: GenerateBody = serde_json::from_str(raw).ok()?;
    if parsed.response.is_empty() {
        None
    } else {
        Some(parsed.response)
    }
}

/// Human-readable names for the AI prompt. The remap is deliberately local
/// to this provider.
fn language_name(code: &str) -> &str {
    match code.split(['-', '_']).next().unwrap_or(code) {
        "zh" => "Simplified Chinese",
        "en" => "English",
        "ja" => "Japanese",
        "ko" => "Korean",
        "fr" => "French",
        "de" => "German",
        "es" => "Spanish",
        "pt" => "Portuguese",
        "it" => "Italian",
        "ru" => "Russian",
        "nl" => "Dutch",
        "ar" => "Arabic",
        "tr" => "Turkish",
        "pl" => "Polish",
        "sv" => "Swedish",
        "uk" => "Ukrainian",
        "vi" => "Vietnamese",
        "hi" => "Hindi",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_family() {
        assert_eq!(
            parse_chat(r#"{"choices":[{"message":{"content":"bonjour"}}]}"#),
            Some("bonjour".to_string())
        );
        assert_eq!(
            parse_thinking(
                r#"{"choices":[{"message":{"content":"<think>hmm</think>bonjour"}}]}"#
            ),
            Some("bonjour".to_string())
        );
        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"bon\"}}]}\n\
                   data: {\"choices\":[{\"delta\":{\"content\":\"jour\"}}]}\n\
                   data: [DONE]";
        assert_eq!(parse_stream(sse), Some("bonjour".to_string()));
        assert_eq!(
            parse_responses(r#"{"output":[{"content":[{"text":"bonjour"}]}]}"#),
            Some("bonjour".to_string())
        );
        assert_eq!(
            parse_generate(r#"{"response":"bonjour"}"#),
            Some("bonjour".to_string())
        );
    }

    #[test]
    fn chat_shape_does_not_parse_generate() {
        assert_eq!(parse_chat(r#"{"response":"x"}"#), None);
        assert_eq!(parse_generate(r#"{"choices":[]}"#), None);
    }

    #[test]
    fn generate_url_derivation() {
        assert_eq!(
            generate_url("http://localhost:11434/v1/chat/completions"),
            "http://localhost:11434/api/generate"
        );
        assert_eq!(
            generate_url("http://localhost:11434"),
            "http://localhost:11434/api/generate"
        );
    }

    #[tokio::test]
    async fn falls_through_to_a_parsing_family() {
        let mut server = mockito::Server::new_async().await;
        // Endpoint replies in ollama shape no matter what; the first chat
        // attempts fail to parse, the generate family succeeds.
        let _chat = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"response":"你好"}"#)
            .expect_at_least(1)
            .create_async()
            .await;
        let _generate = server
            .mock("POST", "/api/generate")
            .with_status(200)
            .with_body(r#"{"response":"你好"}"#)
            .create_async()
            .await;

        let provider = AiTranslator::new(
            format!("{}/v1/chat/completions", server.url()),
            Some("key".to_string()),
            "test-model",
            vec![],
            None,
        );
        let out = provider.translate("hello", "zh", None).await.unwrap();
        assert_eq!(out, "你好");
    }
}
