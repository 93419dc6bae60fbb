//! Outbound delivery: per-channel pacing and message splitting.
//!
//! [`NotificationService`] subscribes to `AgentResponse` events and
//! enqueues them without blocking the publisher.  A single
//! [`DeliveryWorker`] drains the queue, splits oversized messages, and
//! spaces sends so each channel sees at most one message per interval.
//! An event with an empty channel id broadcasts to the configured
//! default channels.  Delivery failures are logged and dropped; one
//! broken channel never blocks the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{AgentResponseEvent, Event, EventHandler};
use crate::slack::ChatApi;
use crate::utils::floor_char_boundary;

/// Minimum spacing between sends to one channel (Slack tolerates about
/// one message per second per channel).
pub const SEND_INTERVAL: Duration = Duration::from_millis(1100);
/// Slack rejects messages past 4000 characters; stay under it.
pub const MAX_MESSAGE_LEN: usize = 3900;

/// Bus-facing half: non-blocking enqueue.
pub struct NotificationService {
    tx: mpsc::UnboundedSender<AgentResponseEvent>,
}

impl NotificationService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentResponseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventHandler for NotificationService {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        if let Event::AgentResponse(response) = event {
            if self.tx.send(response.clone()).is_err() {
                anyhow::bail!("delivery worker is gone");
            }
        }
        Ok(())
    }
}

/// Queue-draining half.  Owns the per-channel send clocks.
pub struct DeliveryWorker {
    chat: Arc<dyn ChatApi>,
    default_channel_ids: Vec<String>,
    interval: Duration,
    max_len: usize,
    last_send: HashMap<String, Instant>,
}

impl DeliveryWorker {
    pub fn new(chat: Arc<dyn ChatApi>, default_channel_ids: Vec<String>) -> Self {
        Self {
            chat,
            default_channel_ids,
            interval: SEND_INTERVAL,
            max_len: MAX_MESSAGE_LEN,
            last_send: HashMap::new(),
        }
    }

    /// Override pacing and length limits (tests).
    pub fn with_limits(mut self, interval: Duration, max_len: usize) -> Self {
        self.interval = interval;
        self.max_len = max_len;
        self
    }

    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<AgentResponseEvent>,
        cancel: CancellationToken,
    ) {
        info!("delivery worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    self.deliver(&event).await;
                }
            }
        }
        info!("delivery worker stopped");
    }

    async fn deliver(&mut self, event: &AgentResponseEvent) {
        if event.text.trim().is_empty() {
            return;
        }

        let targets: Vec<String> = if event.channel_id.is_empty() {
            self.default_channel_ids.clone()
        } else {
            vec![event.channel_id.clone()]
        };
        if targets.is_empty() {
            debug!(event_id = %event.meta.id, "no delivery targets; dropping response");
            return;
        }

        let parts = split_message(&event.text, self.max_len);
        for channel_id in targets {
            for part in &parts {
                self.pace(&channel_id).await;
                if let Err(e) = self.chat.send_message(&channel_id, part).await {
                    warn!(channel_id = %channel_id, error = %e,
                          "delivery failed; dropping remaining parts for this channel");
                    break;
                }
                self.last_send.insert(channel_id.clone(), Instant::now());
            }
        }
    }

    async fn pace(&self, channel_id: &str) {
        if let Some(last) = self.last_send.get(channel_id) {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
    }
}

/// Split `text` into chunks of at most `max_len` bytes, preferring
/// paragraph breaks, then lines, then words, then a hard cut on a char
/// boundary.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    split_by(text, max_len, &["\n\n", "\n", " "])
}

fn split_by(text: &str, max_len: usize, separators: &[&str]) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let Some((&sep, rest)) = separators.split_first() else {
        return hard_split(text, max_len);
    };

    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    for piece in text.split(sep) {
        if piece.len() > max_len {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            parts.extend(split_by(piece, max_len, rest));
            continue;
        }
        if current.is_empty() {
            current.push_str(piece);
        } else if current.len() + sep.len() + piece.len() <= max_len {
            current.push_str(sep);
            current.push_str(piece);
        } else {
            parts.push(std::mem::take(&mut current));
            current.push_str(piece);
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts.retain(|p| !p.trim().is_empty());
    parts
}

fn hard_split(text: &str, max_len: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = text;
    while rest.len() > max_len {
        let mut cut = floor_char_boundary(rest, max_len);
        if cut == 0 {
            // A single char wider than the limit still has to go out.
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        parts.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventMeta;
    use std::sync::Mutex;

    struct RecordingChat {
        sent: Mutex<Vec<(String, String, Instant)>>,
        fail_channel: Option<String>,
    }

    impl RecordingChat {
        fn new() -> Self {
            Self { sent: Mutex::new(Vec::new()), fail_channel: None }
        }
    }

    #[async_trait]
    impl ChatApi for RecordingChat {
        async fn send_message(&self, channel_id: &str, text: &str) -> anyhow::Result<String> {
            if self.fail_channel.as_deref() == Some(channel_id) {
                anyhow::bail!("channel_not_found");
            }
            self.sent.lock().unwrap().push((
                channel_id.to_string(),
                text.to_string(),
                Instant::now(),
            ));
            Ok("1.0".to_string())
        }

        async fn send_blocks(
            &self,
            channel_id: &str,
            text: &str,
            _blocks: &serde_json::Value,
        ) -> anyhow::Result<String> {
            self.send_message(channel_id, text).await
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

    fn response(channel_id: &str, text: &str) -> AgentResponseEvent {
        AgentResponseEvent {
            meta: EventMeta::new("test"),
            channel_id: channel_id.to_string(),
            text: text.to_string(),
            originating_event_id: None,
        }
    }

    #[test]
    fn short_message_is_untouched() {
        assert_eq!(split_message("hello", 3900), vec!["hello"]);
    }

    #[test]
    fn split_prefers_paragraph_breaks() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let parts = split_message(&text, 80);
        assert_eq!(parts, vec!["a".repeat(60), "b".repeat(60)]);
    }

    #[test]
    fn long_message_reconstructs_modulo_seam_whitespace() {
        let paragraph = "the quick brown fox jumps over the lazy dog ".repeat(20);
        let text = vec![paragraph; 6].join("\n\n");
        assert!(text.len() > 5000);

        let parts = split_message(&text, 3900);
        assert!(parts.len() >= 2);
        for part in &parts {
            assert!(part.len() <= 3900);
        }
        let stripped = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
        assert_eq!(stripped(&parts.concat()), stripped(&text));
    }

    #[test]
    fn hard_split_respects_char_boundaries() {
        let text = "é".repeat(50);
        let parts = split_message(&text, 7);
        assert!(parts.iter().all(|p| p.len() <= 7));
        assert_eq!(parts.concat(), text);
    }

    #[tokio::test(start_paused = true)]
    async fn per_channel_spacing_enforced() {
        let chat = Arc::new(RecordingChat::new());
        let (service, rx) = NotificationService::new();
        let cancel = CancellationToken::new();
        let worker = DeliveryWorker::new(chat.clone(), vec![])
            .with_limits(Duration::from_millis(1100), 3900);
        let handle = tokio::spawn(worker.run(rx, cancel.clone()));

        for text in ["one", "two", "three"] {
            service
                .handle(&Event::AgentResponse(response("C1", text)))
                .await
                .unwrap();
        }
        // Paused time auto-advances through the pacing sleeps.
        tokio::time::sleep(Duration::from_secs(10)).await;

        let sent = chat.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        for pair in sent.windows(2) {
            assert!(pair[1].2 - pair[0].2 >= Duration::from_millis(1100));
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_channel_broadcasts_to_defaults() {
        let chat = Arc::new(RecordingChat::new());
        let (service, rx) = NotificationService::new();
        let cancel = CancellationToken::new();
        let worker = DeliveryWorker::new(chat.clone(), vec!["CD1".into(), "CD2".into()])
            .with_limits(Duration::from_millis(10), 3900);
        let handle = tokio::spawn(worker.run(rx, cancel.clone()));

        service
            .handle(&Event::AgentResponse(response("", "broadcast")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let sent = chat.sent.lock().unwrap().clone();
        let channels: Vec<&str> = sent.iter().map(|(c, _, _)| c.as_str()).collect();
        assert_eq!(channels, vec!["CD1", "CD2"]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_channel_does_not_block_others() {
        let chat = Arc::new(RecordingChat {
            sent: Mutex::new(Vec::new()),
            fail_channel: Some("CBAD".to_string()),
        });
        let (service, rx) = NotificationService::new();
        let cancel = CancellationToken::new();
        let worker = DeliveryWorker::new(chat.clone(), vec!["CBAD".into(), "CGOOD".into()])
            .with_limits(Duration::from_millis(10), 3900);
        let handle = tokio::spawn(worker.run(rx, cancel.clone()));

        service
            .handle(&Event::AgentResponse(response("", "news")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let sent = chat.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "CGOOD");

        cancel.cancel();
        handle.await.unwrap();
    }
}
