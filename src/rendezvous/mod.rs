//! Blocking question/answer bridge between an agent run and Slack.
//!
//! While the agent is mid-run it can ask the user something; the run
//! parks on a oneshot until the interactive-actions endpoint resolves
//! the answer or the timeout fires.  Entries are keyed by
//! `{channel}:{user}` and live only in memory; a timeout yields empty
//! answers rather than an error so the agent can continue without
//! input.  A second ask under the same key replaces the first, whose
//! waiter observes the dropped sender and also comes back empty.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::slack::ChatApi;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const ACTION_PREFIX: &str = "ask_user_";

/// One choice offered for a question.
#[derive(Debug, Clone)]
pub struct QuestionOption {
    pub label: String,
    pub description: Option<String>,
}

/// A question the agent wants answered.
#[derive(Debug, Clone)]
pub struct Question {
    pub text: String,
    pub header: Option<String>,
    pub options: Vec<QuestionOption>,
}

struct PendingEntry {
    first_question: String,
    /// Distinguishes this registration from a later one under the same
    /// key, so a timed-out ask never evicts its replacement.
    generation: u64,
    tx: oneshot::Sender<HashMap<String, String>>,
}

/// In-memory store of questions awaiting an answer.
pub struct PendingQuestions {
    timeout: Duration,
    next_generation: AtomicU64,
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl Default for PendingQuestions {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl PendingQuestions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_generation: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Post the questions to the channel and wait for an answer.
    ///
    /// Returns `{first question text: chosen value}` on an answer, and
    /// an empty map on timeout, delivery failure or displacement.
    pub async fn ask(
        &self,
        chat: &dyn ChatApi,
        channel_id: &str,
        user_id: &str,
        questions: &[Question],
    ) -> HashMap<String, String> {
        let Some(first) = questions.first() else {
            return HashMap::new();
        };
        let key = interaction_key(channel_id, user_id);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        // Replacing an entry drops the previous sender; its waiter
        // sees a closed channel and returns empty.
        self.pending.lock().expect("pending poisoned").insert(
            key.clone(),
            PendingEntry {
                first_question: first.text.clone(),
                generation,
                tx,
            },
        );

        let blocks = render_blocks(&key, questions);
        if let Err(e) = chat.send_blocks(channel_id, &first.text, &blocks).await {
            warn!(channel_id, error = %e, "failed to post question; returning empty answers");
            self.remove_if_current(&key, generation);
            return HashMap::new();
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(answers)) => answers,
            Ok(Err(_)) => {
                // Displaced by a newer ask under the same key.
                debug!(key, "pending question displaced");
                HashMap::new()
            }
            Err(_) => {
                debug!(key, "question timed out");
                self.remove_if_current(&key, generation);
                HashMap::new()
            }
        }
    }

    /// Remove the entry under `key` only if it is still the one this
    /// registration created.  A newer ask may have replaced it between
    /// the timeout firing and the lock being taken.
    fn remove_if_current(&self, key: &str, generation: u64) -> bool {
        let mut pending = self.pending.lock().expect("pending poisoned");
        if pending.get(key).is_some_and(|e| e.generation == generation) {
            pending.remove(key);
            true
        } else {
            false
        }
    }

    /// Deliver an answer for a button click.  Returns false when no
    /// waiter is registered for the action id (stale click, replay, or
    /// already answered).
    pub fn resolve(&self, action_id: &str, value: &str) -> bool {
        let Some(key) = parse_action_id(action_id) else {
            return false;
        };
        let Some(entry) = self.pending.lock().expect("pending poisoned").remove(&key) else {
            return false;
        };

        let mut answers = HashMap::new();
        answers.insert(entry.first_question, value.to_string());
        // A dropped receiver just means the waiter already gave up.
        entry.tx.send(answers).is_ok()
    }
}

pub fn interaction_key(channel_id: &str, user_id: &str) -> String {
    format!("{channel_id}:{user_id}")
}

/// Questions arriving as a structured JSON payload (agent tool input).
pub fn questions_from_json(payload: &Value) -> Vec<Question> {
    let Some(items) = payload.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|q| {
            let text = q["text"].as_str()?.to_string();
            let options = q["options"]
                .as_array()
                .map(|opts| {
                    opts.iter()
                        .filter_map(|o| {
                            Some(QuestionOption {
                                label: o["label"].as_str()?.to_string(),
                                description: o["description"].as_str().map(str::to_string),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(Question {
                text,
                header: q["header"].as_str().map(str::to_string),
                options,
            })
        })
        .collect()
}

/// Recover the interaction key from `ask_user_{key}_{index}`.
fn parse_action_id(action_id: &str) -> Option<String> {
    let rest = action_id.strip_prefix(ACTION_PREFIX)?;
    let (key, index) = rest.rsplit_once('_')?;
    index.parse::<usize>().ok()?;
    Some(key.to_string())
}

/// Block Kit rendering: one section per question plus a button row per
/// question's options.
fn render_blocks(key: &str, questions: &[Question]) -> Value {
    let mut blocks = Vec::new();
    for (index, question) in questions.iter().enumerate() {
        if let Some(header) = &question.header {
            blocks.push(json!({
                "type": "header",
                "text": { "type": "plain_text", "text": header }
            }));
        }
        blocks.push(json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": question.text }
        }));
        if !question.options.is_empty() {
            let elements: Vec<Value> = question
                .options
                .iter()
                .map(|opt| {
                    json!({
                        "type": "button",
                        "text": { "type": "plain_text", "text": opt.label },
                        "action_id": format!("{ACTION_PREFIX}{key}_{index}"),
                        "value": opt.label,
                    })
                })
                .collect();
            blocks.push(json!({ "type": "actions", "elements": elements }));
            if let Some(description) = question
                .options
                .iter()
                .find_map(|o| o.description.as_deref())
            {
                blocks.push(json!({
                    "type": "context",
                    "elements": [{ "type": "mrkdwn", "text": description }]
                }));
            }
        }
    }
    Value::Array(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    #[derive(Default)]
    struct MockChat {
        posted: Mutex<Vec<Value>>,
        fail: bool,
    }

    #[async_trait]
    impl ChatApi for MockChat {
        async fn send_message(&self, _channel_id: &str, _text: &str) -> anyhow::Result<String> {
            Ok("1.0".to_string())
        }

        async fn send_blocks(
            &self,
            _channel_id: &str,
            _text: &str,
            blocks: &Value,
        ) -> anyhow::Result<String> {
            if self.fail {
                anyhow::bail!("channel_not_found");
            }
            self.posted.lock().unwrap().push(blocks.clone());
            Ok("1.0".to_string())
        }

        async fn history_since(
            &self,
            _channel_id: &str,
            _oldest: Option<&str>,
            _limit: usize,
        ) -> anyhow::Result<Vec<crate::slack::HistoryEntry>> {
            Ok(vec![])
        }

        async fn list_channels(&self) -> anyhow::Result<Vec<crate::slack::ChannelInfo>> {
            Ok(vec![])
        }

        async fn create_channel(&self, _name: &str) -> anyhow::Result<crate::slack::ChannelInfo> {
            anyhow::bail!("unsupported")
        }

        async fn set_channel_purpose(&self, _channel_id: &str, _purpose: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn question(text: &str) -> Question {
        Question {
            text: text.to_string(),
            header: None,
            options: vec![
                QuestionOption { label: "yes".into(), description: None },
                QuestionOption { label: "no".into(), description: None },
            ],
        }
    }

    #[test]
    fn action_id_roundtrip() {
        let key = interaction_key("C1", "U1");
        let action_id = format!("{ACTION_PREFIX}{key}_0");
        assert_eq!(parse_action_id(&action_id).as_deref(), Some("C1:U1"));
        assert!(parse_action_id("something_else").is_none());
        assert!(parse_action_id("ask_user_C1:U1_notanumber").is_none());
    }

    #[tokio::test]
    async fn answer_resolves_before_timeout() {
        let pending = Arc::new(PendingQuestions::new(Duration::from_secs(5)));
        let chat = Arc::new(MockChat::default());

        let asker = {
            let pending = pending.clone();
            let chat = chat.clone();
            tokio::spawn(async move {
                pending.ask(chat.as_ref(), "C1", "U1", &[question("Deploy?")]).await
            })
        };

        // Let the ask register and post before clicking.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pending.resolve("ask_user_C1:U1_0", "yes"));

        let answers = asker.await.unwrap();
        assert_eq!(answers.get("Deploy?").map(String::as_str), Some("yes"));
        // The waiter is gone; a second click is stale.
        assert!(!pending.resolve("ask_user_C1:U1_0", "no"));
    }

    #[tokio::test]
    async fn timeout_returns_empty() {
        let pending = PendingQuestions::new(Duration::from_millis(50));
        let chat = MockChat::default();
        let answers = pending.ask(&chat, "C1", "U1", &[question("Deploy?")]).await;
        assert!(answers.is_empty());
        assert!(!pending.resolve("ask_user_C1:U1_0", "yes"));
    }

    #[tokio::test]
    async fn delivery_failure_returns_empty_immediately() {
        let pending = PendingQuestions::new(Duration::from_secs(60));
        let chat = MockChat { fail: true, ..Default::default() };
        let answers = pending.ask(&chat, "C1", "U1", &[question("Deploy?")]).await;
        assert!(answers.is_empty());
    }

    #[tokio::test]
    async fn second_ask_displaces_the_first() {
        let pending = Arc::new(PendingQuestions::new(Duration::from_secs(5)));
        let chat = Arc::new(MockChat::default());

        let first = {
            let pending = pending.clone();
            let chat = chat.clone();
            tokio::spawn(async move {
                pending.ask(chat.as_ref(), "C1", "U1", &[question("First?")]).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = {
            let pending = pending.clone();
            let chat = chat.clone();
            tokio::spawn(async move {
                pending.ask(chat.as_ref(), "C1", "U1", &[question("Second?")]).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The displaced waiter comes back empty without an answer.
        assert!(first.await.unwrap().is_empty());

        assert!(pending.resolve("ask_user_C1:U1_0", "ok"));
        let answers = second.await.unwrap();
        assert_eq!(answers.get("Second?").map(String::as_str), Some("ok"));
    }

    #[tokio::test]
    async fn stale_cleanup_spares_a_newer_entry() {
        let pending = Arc::new(PendingQuestions::new(Duration::from_secs(5)));
        let chat = Arc::new(MockChat::default());

        let first = {
            let pending = pending.clone();
            let chat = chat.clone();
            tokio::spawn(async move {
                pending.ask(chat.as_ref(), "C1", "U1", &[question("First?")]).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = {
            let pending = pending.clone();
            let chat = chat.clone();
            tokio::spawn(async move {
                pending.ask(chat.as_ref(), "C1", "U1", &[question("Second?")]).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.await.unwrap();

        // The first ask's cleanup (generation 0) must leave the second
        // ask's entry in place and answerable.
        assert!(!pending.remove_if_current("C1:U1", 0));
        assert!(pending.resolve("ask_user_C1:U1_0", "ok"));
        let answers = second.await.unwrap();
        assert_eq!(answers.get("Second?").map(String::as_str), Some("ok"));
    }

    #[test]
    fn questions_parse_from_json() {
        let payload = json!([
            {
                "text": "Deploy to prod?",
                "options": [
                    { "label": "yes" },
                    { "label": "no", "description": "wait for review" }
                ]
            }
        ]);
        let questions = questions_from_json(&payload);
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].options.len(), 2);
        assert_eq!(
            questions[0].options[1].description.as_deref(),
            Some("wait for review")
        );
        assert!(questions_from_json(&json!({"not": "an array"})).is_empty());
    }

    #[tokio::test]
    async fn rendered_blocks_carry_action_ids() {
        let pending = PendingQuestions::new(Duration::from_millis(50));
        let chat = MockChat::default();
        pending.ask(&chat, "C1", "U1", &[question("Deploy?")]).await;

        let posted = chat.posted.lock().unwrap();
        let rendered = serde_json::to_string(&posted[0]).unwrap();
        assert!(rendered.contains("ask_user_C1:U1_0"));
        assert!(rendered.contains("Deploy?"));
    }
}
