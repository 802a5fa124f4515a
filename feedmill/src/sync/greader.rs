/*!
Minimal client for the Google-Reader-API subset that FreshRSS-compatible
aggregators speak: ClientLogin, action token, stream contents, edit-tag.
*/

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::httpclient;

pub const TAG_READ: &str = "user/-/state/com.google/read";
pub const TAG_STARRED: &str = "user/-/state/com.google/starred";
pub const STREAM_READING_LIST: &str = "user/-/state/com.google/reading-list";

const TIMEOUT_SECS: u64 = 30;

/// Connection settings for a user's external aggregator, decrypted and
/// resolved from the user's settings object.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub proxy: Option<String>,
}

pub struct GReaderClient {
    config: AggregatorConfig,
    auth_token: Option<String>,
    action_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub published: Option<i64>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub canonical: Vec<RemoteLink>,
    #[serde(default)]
    pub alternate: Vec<RemoteLink>,
    #[serde(default)]
    pub summary: Option<RemoteSummary>,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteLink {
    pub href: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSummary {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamContents {
    #[serde(default)]
    items: Vec<RemoteItem>,
}

impl RemoteItem {
    pub fn link(&self) -> Option<&str> {
        self.canonical
            .first()
            .or_else(|| self.alternate.first())
            .map(|l| l.href.as_str())
    }
}

impl GReaderClient {
    pub fn new(config: AggregatorConfig) -> Self {
        GReaderClient {
            config,
            auth_token: None,
            action_token: None,
        }
    }

    fn http(&self) -> Result<reqwest::Client> {
        httpclient::client(self.config.proxy.as_deref(), TIMEOUT_SECS)
    }

    fn base(&self) -> &str {
        self.config.endpoint.trim_end_matches('/')
    }

    /// ClientLogin: exchanges credentials for the GoogleLogin auth token.
    async fn login(&mut self) -> Result<String> {
        if let Some(token) = &self.auth_token {
            return Ok(token.clone());
        }
        let url = format!("{}/accounts/ClientLogin", self.base());
        let response = self
            .http()?
            .post(&url)
            .form(&[
                ("Email", self.config.username.as_str()),
                ("Passwd", self.config.password.as_str()),
            ])
            .send()
            .await
            .context("aggregator login request failed")?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("aggregator login rejected ({}): {}", status, body);
        }
        let token = body
            .lines()
            .find_map(|line| line.strip_prefix("Auth="))
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("aggregator login response has no Auth line"))?;
        self.auth_token = Some(token.clone());
        Ok(token)
    }

    /// The short-lived T token required by mutating endpoints.
    async fn action_token(&mut self) -> Result<String> {
        if let Some(token) = &self.action_token {
            return Ok(token.clone());
        }
        let auth = self.login().await?;
        let url = format!("{}/reader/api/0/token", self.base());
        let response = self
            .http()?
            .get(&url)
            .header("Authorization", format!("GoogleLogin auth={}", auth))
            .send()
            .await
            .context("aggregator token request failed")?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("aggregator token rejected ({})", status);
        }
        let token = body.trim().to_string();
        self.action_token = Some(token.clone());
        Ok(token)
    }

    /// Fetch stream contents, optionally excluding read items.
    pub async fn stream_contents(
        &mut self,
        stream_id: &str,
        exclude_read: bool,
        limit: u32,
    ) -> Result<Vec<RemoteItem>> {
        let auth = self.login().await?;
        let mut url = format!(
            "{}/reader/api/0/stream/contents/{}?output=json&n={}",
            self.base(),
            urlencode(stream_id),
            limit
        );
        if exclude_read {
            url.push_str("&xt=");
            url.push_str(&urlencode(TAG_READ));
        }
        let response = self
            .http()?
            .get(&url)
            .header("Authorization", format!("GoogleLogin auth={}", auth))
            .send()
            .await
            .context("aggregator stream request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("aggregator stream rejected ({})", status);
        }
        let contents: StreamContents = response
            .json()
            .await
            .context("aggregator stream response is not valid JSON")?;
        Ok(contents.items)
    }

    /// Add and/or remove a state tag on one item. Tag operations are
    /// idempotent on the aggregator side (last-writer-wins).
    pub async fn edit_tag(
        &mut self,
        item_id: &str,
        add: Option<&str>,
        remove: Option<&str>,
    ) -> Result<()> {
        let auth = self.login().await?;
        let token = self.action_token().await?;
        let url = format!("{}/reader/api/0/edit-tag", self.base());

        let mut form: Vec<(&str, &str)> = vec![("i", item_id), ("T", token.as_str())];
        if let Some(tag) = add {
            form.push(("a", tag));
        }
        if let Some(tag) = remove {
            form.push(("r", tag));
        }

        let response = self
            .http()?
            .post(&url)
            .header("Authorization", format!("GoogleLogin auth={}", auth))
            .form(&form)
            .send()
            .await
            .context("aggregator edit-tag request failed")?;
        let status = response.status();
        if !status.is_success() {
            // A stale T token is the common failure; drop it so the next
            // attempt re-fetches.
            self.action_token = None;
            anyhow::bail!("aggregator edit-tag rejected ({})", status);
        }
        Ok(())
    }
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(endpoint: &str) -> AggregatorConfig {
        AggregatorConfig {
            endpoint: endpoint.to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
            proxy: None,
        }
    }

    #[tokio::test]
    async fn login_parses_auth_line() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/accounts/ClientLogin")
            .with_status(200)
            .with_body("SID=abc\nLSID=def\nAuth=secret-token\n")
            .create_async()
            .await;

        let mut client = GReaderClient::new(test_config(&server.url()));
        let token = client.login().await.unwrap();
        assert_eq!(token, "secret-token");
        // Token is cached; a second call does not re-hit the endpoint.
        let token2 = client.login().await.unwrap();
        assert_eq!(token2, "secret-token");
    }

    #[tokio::test]
    async fn stream_contents_parses_items() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/accounts/ClientLogin")
            .with_status(200)
            .with_body("Auth=t\n")
            .create_async()
            .await;
        let _stream = server
            .mock(
                "GET",
                mockito::Matcher::Regex(r"^/reader/api/0/stream/contents/.*".to_string()),
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"items":[{"id":"tag:google.com,2005:reader/item/00000001",
                    "title":"Remote title",
                    "published":1704103200,
                    "canonical":[{"href":"https://example.com/r1"}],
                    "summary":{"content":"<p>remote body</p>"}}]}"#,
            )
            .create_async()
            .await;

        let mut client = GReaderClient::new(test_config(&server.url()));
        let items = client
            .stream_contents(STREAM_READING_LIST, true, 100)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title.as_deref(), Some("Remote title"));
        assert_eq!(items[0].link(), Some("https://example.com/r1"));
    }

    #[tokio::test]
    async fn edit_tag_posts_form() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/accounts/ClientLogin")
            .with_status(200)
            .with_body("Auth=t\n")
            .create_async()
            .await;
        let _token = server
            .mock("GET", "/reader/api/0/token")
            .with_status(200)
            .with_body("T123")
            .create_async()
            .await;
        let edit = server
            .mock("POST", "/reader/api/0/edit-tag")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("i".into(), "item-1".into()),
                mockito::Matcher::UrlEncoded("a".into(), TAG_READ.into()),
                mockito::Matcher::UrlEncoded("T".into(), "T123".into()),
            ]))
            .with_status(200)
            .with_body("OK")
            .create_async()
            .await;

        let mut client = GReaderClient::new(test_config(&server.url()));
        client.edit_tag("item-1", Some(TAG_READ), None).await.unwrap();
        edit.assert_async().await;
    }
}
