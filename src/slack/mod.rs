//! Slack Web API surface.
//!
//! [`ChatApi`] is the seam the rest of the code talks through; tests
//! swap in mocks and production uses [`SlackClient`], a thin reqwest
//! wrapper.  Every Web API response carries an `ok` field that is the
//! real success signal regardless of HTTP status, so the wrapper checks
//! it on every call.

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://slack.com/api";

/// One message from channel history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub user: String,
    pub text: String,
    pub ts: String,
    pub is_bot: bool,
}

/// Channel id + name, as returned by list/create.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
}

/// Chat-platform operations the bot needs.
#[async_trait]
pub trait ChatApi: Send + Sync + 'static {
    /// Post plain text.  Returns the message timestamp (Slack's `ts`),
    /// which doubles as the channel-position marker.
    async fn send_message(&self, channel_id: &str, text: &str) -> anyhow::Result<String>;

    /// Post a Block Kit payload with `text` as the fallback.
    async fn send_blocks(
        &self,
        channel_id: &str,
        text: &str,
        blocks: &Value,
    ) -> anyhow::Result<String>;

    /// Channel history, newest first as the API returns it.  `oldest`
    /// bounds the window to messages after that timestamp.
    async fn history_since(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<HistoryEntry>>;

    /// All non-archived public channels visible to the bot.
    async fn list_channels(&self) -> anyhow::Result<Vec<ChannelInfo>>;

    async fn create_channel(&self, name: &str) -> anyhow::Result<ChannelInfo>;

    async fn set_channel_purpose(&self, channel_id: &str, purpose: &str) -> anyhow::Result<()>;

    /// Upload a text file into a channel.  Backends without file
    /// support report an error rather than dropping the content.
    async fn upload_file(
        &self,
        _channel_id: &str,
        filename: &str,
        _content: &str,
    ) -> anyhow::Result<()> {
        anyhow::bail!("file upload not supported: {filename}")
    }

    /// Slack DM channel ids start with `D`.
    fn is_direct(&self, channel_id: &str) -> bool {
        channel_id.starts_with('D')
    }
}

/// reqwest-backed [`ChatApi`] implementation.
pub struct SlackClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl SlackClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    /// Point the client at an alternate endpoint (tests).
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            base_url: base_url.into(),
        }
    }

    /// POST a Web API method and return the parsed body after checking
    /// the `ok` field.
    async fn call(&self, method: &str, body: Value) -> anyhow::Result<Value> {
        let url = format!("{}/{}", self.base_url, method);
        debug!(method, "slack api call");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("slack {method} request failed"))?;

        let payload: Value = response
            .json()
            .await
            .with_context(|| format!("slack {method} returned non-JSON body"))?;

        if payload["ok"].as_bool() != Some(true) {
            let err = payload["error"].as_str().unwrap_or("unknown_error");
            anyhow::bail!("slack {method} failed: {err}");
        }
        Ok(payload)
    }

    /// Same as `call`, but form-encoded (`files.upload` rejects JSON
    /// bodies).
    async fn call_form(&self, method: &str, form: &[(&str, &str)]) -> anyhow::Result<Value> {
        let url = format!("{}/{}", self.base_url, method);
        debug!(method, "slack api call");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .form(form)
            .send()
            .await
            .with_context(|| format!("slack {method} request failed"))?;

        let payload: Value = response
            .json()
            .await
            .with_context(|| format!("slack {method} returned non-JSON body"))?;

        if payload["ok"].as_bool() != Some(true) {
            let err = payload["error"].as_str().unwrap_or("unknown_error");
            anyhow::bail!("slack {method} failed: {err}");
        }
        Ok(payload)
    }
}

#[async_trait]
impl ChatApi for SlackClient {
    async fn send_message(&self, channel_id: &str, text: &str) -> anyhow::Result<String> {
        let payload = self
            .call(
                "chat.postMessage",
                json!({ "channel": channel_id, "text": text }),
            )
            .await?;
        Ok(payload["ts"].as_str().unwrap_or_default().to_string())
    }

    async fn send_blocks(
        &self,
        channel_id: &str,
        text: &str,
        blocks: &Value,
    ) -> anyhow::Result<String> {
        let payload = self
            .call(
                "chat.postMessage",
                json!({ "channel": channel_id, "text": text, "blocks": blocks }),
            )
            .await?;
        Ok(payload["ts"].as_str().unwrap_or_default().to_string())
    }

    async fn history_since(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<HistoryEntry>> {
        let mut body = json!({ "channel": channel_id, "limit": limit });
        if let Some(oldest) = oldest {
            body["oldest"] = json!(oldest);
        }
        let payload = self.call("conversations.history", body).await?;

        let messages = payload["messages"].as_array().cloned().unwrap_or_default();
        Ok(messages
            .iter()
            .map(|m| HistoryEntry {
                user: m["user"].as_str().unwrap_or_default().to_string(),
                text: m["text"].as_str().unwrap_or_default().to_string(),
                ts: m["ts"].as_str().unwrap_or_default().to_string(),
                is_bot: m.get("bot_id").is_some_and(|b| !b.is_null())
                    || m["subtype"].as_str() == Some("bot_message"),
            })
            .collect())
    }

    async fn list_channels(&self) -> anyhow::Result<Vec<ChannelInfo>> {
        let payload = self
            .call(
                "conversations.list",
                json!({ "exclude_archived": true, "limit": 1000 }),
            )
            .await?;
        let channels = payload["channels"].as_array().cloned().unwrap_or_default();
        Ok(channels
            .iter()
            .filter_map(|c| {
                Some(ChannelInfo {
                    id: c["id"].as_str()?.to_string(),
                    name: c["name"].as_str().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }

    async fn create_channel(&self, name: &str) -> anyhow::Result<ChannelInfo> {
        let payload = self
            .call("conversations.create", json!({ "name": name }))
            .await?;
        let channel = &payload["channel"];
        Ok(ChannelInfo {
            id: channel["id"]
                .as_str()
                .context("conversations.create returned no channel id")?
                .to_string(),
            name: channel["name"].as_str().unwrap_or(name).to_string(),
        })
    }

    async fn set_channel_purpose(&self, channel_id: &str, purpose: &str) -> anyhow::Result<()> {
        self.call(
            "conversations.setPurpose",
            json!({ "channel": channel_id, "purpose": purpose }),
        )
        .await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        channel_id: &str,
        filename: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        self.call_form(
            "files.upload",
            &[
                ("channels", channel_id),
                ("filename", filename),
                ("content", content),
            ],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn send_message_returns_ts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .and(header("authorization", "Bearer xoxb-test"))
            .and(body_partial_json(json!({ "channel": "C1", "text": "hi" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "ok": true, "ts": "1700000000.000100" })),
            )
            .mount(&server)
            .await;

        let client = SlackClient::with_base_url("xoxb-test", server.uri());
        let ts = client.send_message("C1", "hi").await.unwrap();
        assert_eq!(ts, "1700000000.000100");
    }

    #[tokio::test]
    async fn api_level_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "ok": false, "error": "channel_not_found" })),
            )
            .mount(&server)
            .await;

        let client = SlackClient::with_base_url("xoxb-test", server.uri());
        let err = client.send_message("C404", "hi").await.unwrap_err();
        assert!(err.to_string().contains("channel_not_found"));
    }

    #[tokio::test]
    async fn history_marks_bot_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/conversations.history"))
            .and(body_partial_json(json!({ "channel": "C1", "oldest": "1.0" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "messages": [
                    { "user": "U2", "text": "newer", "ts": "3.0" },
                    { "user": "", "bot_id": "B1", "text": "from bot", "ts": "2.0" },
                ]
            })))
            .mount(&server)
            .await;

        let client = SlackClient::with_base_url("xoxb-test", server.uri());
        let history = client.history_since("C1", Some("1.0"), 50).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].is_bot);
        assert!(history[1].is_bot);
    }

    #[tokio::test]
    async fn create_channel_parses_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/conversations.create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "channel": { "id": "C9", "name": "pan-api" }
            })))
            .mount(&server)
            .await;

        let client = SlackClient::with_base_url("xoxb-test", server.uri());
        let channel = client.create_channel("pan-api").await.unwrap();
        assert_eq!(channel.id, "C9");
        assert_eq!(channel.name, "pan-api");
    }

    #[tokio::test]
    async fn upload_file_is_form_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files.upload"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(wiremock::matchers::body_string_contains("filename=notes.md"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .mount(&server)
            .await;

        let client = SlackClient::with_base_url("xoxb-test", server.uri());
        client.upload_file("C1", "notes.md", "# notes").await.unwrap();
    }

    #[test]
    fn dm_detection() {
        let client = SlackClient::new("t");
        assert!(client.is_direct("D12345"));
        assert!(!client.is_direct("C12345"));
    }
}
