//! Project registry, channel routing and per-channel state.
//!
//! Every conversation happens in a Slack channel bound to exactly one
//! project (a directory under the approved root).  Resolution checks an
//! in-memory cache, then the static config binding, then the persisted
//! dynamic mapping; `sync_channels` reconciles the registry against the
//! workspace at startup using the `pan-{slug}` naming convention.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::slack::ChatApi;
use crate::storage::Database;

/// A configured project.  Immutable after config load.
#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub slug: String,
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub require_mention: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Lookup over the configured projects.
#[derive(Debug, Clone, Default)]
pub struct ProjectRegistry {
    projects: Vec<Project>,
}

impl ProjectRegistry {
    pub fn new(projects: Vec<Project>) -> Self {
        Self { projects }
    }

    pub fn by_slug(&self, slug: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.slug == slug)
    }

    pub fn by_channel_id(&self, channel_id: &str) -> Option<&Project> {
        self.projects
            .iter()
            .find(|p| p.channel_id.as_deref() == Some(channel_id))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Project> {
        self.projects.iter().filter(|p| p.enabled)
    }
}

/// Durable per-channel conversation state.
#[derive(Debug, Clone)]
pub struct ChannelState {
    pub channel_id: String,
    pub project_slug: String,
    pub current_directory: PathBuf,
    pub agent_session_id: Option<String>,
    pub last_response_marker: Option<String>,
}

/// Summary of a `sync_channels` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub created: usize,
    pub reused: usize,
    pub failed: usize,
}

/// History window when catching up without a marker.
const GAP_FALLBACK_LIMIT: usize = 10;
/// History window when a marker bounds the gap.
const GAP_MARKER_LIMIT: usize = 50;

pub struct ChannelRouter {
    registry: ProjectRegistry,
    db: Arc<Database>,
    cache: RwLock<HashMap<String, String>>,
}

impl ChannelRouter {
    pub fn new(registry: ProjectRegistry, db: Arc<Database>) -> Self {
        Self {
            registry,
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    /// Resolve the project bound to a channel: cache, then static
    /// config binding, then persisted dynamic mapping.  Hits populate
    /// the cache; disabled projects resolve to nothing.
    pub async fn resolve_project(&self, channel_id: &str) -> anyhow::Result<Option<Project>> {
        if channel_id.is_empty() {
            return Ok(None);
        }

        if let Some(slug) = self.cache.read().await.get(channel_id).cloned() {
            return Ok(self
                .registry
                .by_slug(&slug)
                .filter(|p| p.enabled)
                .cloned());
        }

        if let Some(project) = self.registry.by_channel_id(channel_id) {
            if project.enabled {
                self.cache
                    .write()
                    .await
                    .insert(channel_id.to_string(), project.slug.clone());
                return Ok(Some(project.clone()));
            }
            return Ok(None);
        }

        if let Some(slug) = self.db.project_for_channel(channel_id)? {
            if let Some(project) = self.registry.by_slug(&slug) {
                if project.enabled {
                    self.cache
                        .write()
                        .await
                        .insert(channel_id.to_string(), slug);
                    return Ok(Some(project.clone()));
                }
            }
        }

        Ok(None)
    }

    /// Load the channel's state, defaulting to a fresh one rooted at
    /// the project directory.  A stored working directory that escaped
    /// the project root or no longer exists falls back to the root.
    pub fn load_channel_state(
        &self,
        channel_id: &str,
        project: &Project,
    ) -> anyhow::Result<ChannelState> {
        let mut state = match self.db.load_channel_state(channel_id)? {
            Some(state) => state,
            None => ChannelState {
                channel_id: channel_id.to_string(),
                project_slug: project.slug.clone(),
                current_directory: project.path.clone(),
                agent_session_id: None,
                last_response_marker: None,
            },
        };
        state.current_directory = clamp_directory(&state.current_directory, &project.path);
        Ok(state)
    }

    /// Persist the channel's state.  Runs after every handled inbound
    /// event regardless of how the handling went.
    pub fn save_channel_state(
        &self,
        state: &ChannelState,
        project: &Project,
    ) -> anyhow::Result<()> {
        let mut state = state.clone();
        state.current_directory = clamp_directory(&state.current_directory, &project.path);
        self.db.save_channel_state(&state)
    }

    /// Reconcile enabled projects with Slack channels: reuse a
    /// configured channel id, a persisted mapping, or an existing
    /// `pan-{slug}` channel; create the channel otherwise.
    pub async fn sync_channels(&self, chat: &dyn ChatApi) -> anyhow::Result<SyncResult> {
        let mut result = SyncResult::default();

        let existing = chat.list_channels().await?;
        let by_name: HashMap<&str, &str> = existing
            .iter()
            .map(|c| (c.name.as_str(), c.id.as_str()))
            .collect();
        let known_ids: std::collections::HashSet<&str> =
            existing.iter().map(|c| c.id.as_str()).collect();

        for project in self.registry.enabled() {
            if let Some(channel_id) = &project.channel_id {
                // DM channels never show up in conversations.list but
                // are valid routing targets.
                if known_ids.contains(channel_id.as_str()) || chat.is_direct(channel_id) {
                    self.cache
                        .write()
                        .await
                        .insert(channel_id.clone(), project.slug.clone());
                    result.reused += 1;
                } else {
                    warn!(slug = %project.slug, channel_id = %channel_id,
                          "configured channel id not found in workspace");
                    result.failed += 1;
                }
                continue;
            }

            if let Some(channel_id) = self.db.channel_for_project(&project.slug)? {
                self.cache
                    .write()
                    .await
                    .insert(channel_id, project.slug.clone());
                result.reused += 1;
                continue;
            }

            let name = project_channel_name(&project.slug);
            if let Some(channel_id) = by_name.get(name.as_str()) {
                self.db.map_channel(channel_id, &project.slug)?;
                self.cache
                    .write()
                    .await
                    .insert(channel_id.to_string(), project.slug.clone());
                result.reused += 1;
                continue;
            }

            match chat.create_channel(&name).await {
                Ok(channel) => {
                    if let Err(e) = chat
                        .set_channel_purpose(
                            &channel.id,
                            &format!("Coding agent project: {}", project.name),
                        )
                        .await
                    {
                        warn!(channel = %name, error = %e, "failed to set channel purpose");
                    }
                    let intro = format!(
                        "*{}*\n\nThis channel is mapped to a project directory. \
                         Send messages here to work on this project.",
                        project.name
                    );
                    if let Err(e) = chat.send_message(&channel.id, &intro).await {
                        warn!(channel = %name, error = %e, "failed to post intro message");
                    }
                    self.db.map_channel(&channel.id, &project.slug)?;
                    self.cache
                        .write()
                        .await
                        .insert(channel.id.clone(), project.slug.clone());
                    info!(slug = %project.slug, channel_id = %channel.id, "created project channel");
                    result.created += 1;
                }
                Err(e) => {
                    warn!(slug = %project.slug, channel = %name, error = %e,
                          "failed to create project channel");
                    result.failed += 1;
                }
            }
        }

        Ok(result)
    }

    /// Catch-up preamble for a mention-gated channel: the human
    /// messages posted since the bot's last reply, oldest first.
    pub async fn gap_preamble(
        &self,
        chat: &dyn ChatApi,
        channel_id: &str,
        marker: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        let limit = if marker.is_some() {
            GAP_MARKER_LIMIT
        } else {
            GAP_FALLBACK_LIMIT
        };
        let mut messages = chat.history_since(channel_id, marker, limit).await?;
        messages.retain(|m| !m.is_bot && !m.text.trim().is_empty());
        if messages.is_empty() {
            return Ok(None);
        }

        // Slack returns newest first.
        messages.reverse();
        let block = messages
            .iter()
            .map(|m| format!("<@{}>: {}", m.user, m.text))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(Some(format!(
            "Here is the recent conversation in this channel \
             since your last response (for context):\n\n{block}\n\n\
             Now the user is addressing you directly:\n"
        )))
    }
}

/// Reply sent when a message arrives in a channel bound to no project.
pub fn guidance_message() -> &'static str {
    "*Project Channel Required*\n\n\
     This bot is configured for project channels.\n\
     Please send messages in a `#pan-` project channel."
}

/// Slack channel name for a project slug.
pub fn project_channel_name(slug: &str) -> String {
    let name = format!("pan-{}", slug.to_lowercase())
        .replace(' ', "-")
        .replace('_', "-");
    name.chars().take(80).collect()
}

fn clamp_directory(dir: &Path, root: &Path) -> PathBuf {
    if dir.starts_with(root) && dir.is_dir() {
        dir.to_path_buf()
    } else {
        root.to_path_buf()
    }
}

/// Mention gate for a channel that requires one.
///
/// Returns the message with the trigger stripped when the bot is
/// addressed (bot name as a whole word anywhere, case-insensitive, or a
/// `<@U...>` mention marker), `None` when it is not.  A message that is
/// nothing but the trigger comes back unchanged rather than empty.
pub fn strip_mention(text: &str, bot_name: &str) -> Option<String> {
    let trimmed = text.trim_start();

    if let Some((start, end)) = find_word(trimmed, bot_name) {
        let cleaned = format!("{}{}", &trimmed[..start], &trimmed[end..]);
        let cleaned = cleaned.trim_matches([' ', ',', ':', ';', '-']).to_string();
        return Some(if cleaned.is_empty() {
            text.to_string()
        } else {
            cleaned
        });
    }

    if let Some((start, end)) = find_user_mention(trimmed) {
        let rest = &trimmed[end..];
        let rest = rest.trim_start();
        let cleaned = format!("{}{}", &trimmed[..start], rest);
        let cleaned = cleaned.trim().to_string();
        return Some(if cleaned.is_empty() {
            text.to_string()
        } else {
            cleaned
        });
    }

    None
}

/// First whole-word, ASCII-case-insensitive occurrence of `word`.
fn find_word(haystack: &str, word: &str) -> Option<(usize, usize)> {
    if word.is_empty() || haystack.len() < word.len() {
        return None;
    }
    let bytes = haystack.as_bytes();
    let needle = word.as_bytes();
    for start in 0..=bytes.len() - needle.len() {
        if !haystack.is_char_boundary(start) {
            continue;
        }
        let end = start + needle.len();
        if !haystack.is_char_boundary(end) {
            continue;
        }
        if !bytes[start..end].eq_ignore_ascii_case(needle) {
            continue;
        }
        let before_ok = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
        let after_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return Some((start, end));
        }
    }
    None
}

/// First `<@U...>` Slack mention marker.
fn find_user_mention(haystack: &str) -> Option<(usize, usize)> {
    let start = haystack.find("<@U")?;
    let rest = &haystack[start + 3..];
    let close = rest.find('>')?;
    if rest[..close]
        .bytes()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
    {
        Some((start, start + 3 + close + 1))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slack::{ChannelInfo, HistoryEntry};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockChat {
        channels: Vec<ChannelInfo>,
        history: Vec<HistoryEntry>,
        sent: Mutex<Vec<(String, String)>>,
        created: Mutex<Vec<String>>,
        fail_create: bool,
    }

    #[async_trait]
    impl ChatApi for MockChat {
        async fn send_message(&self, channel_id: &str, text: &str) -> anyhow::Result<String> {
            self.sent
                .lock()
                .unwrap()
                .push((channel_id.to_string(), text.to_string()));
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
            limit: usize,
        ) -> anyhow::Result<Vec<HistoryEntry>> {
            Ok(self.history.iter().take(limit).cloned().collect())
        }

        async fn list_channels(&self) -> anyhow::Result<Vec<ChannelInfo>> {
            Ok(self.channels.clone())
        }

        async fn create_channel(&self, name: &str) -> anyhow::Result<ChannelInfo> {
            if self.fail_create {
                anyhow::bail!("name_taken");
            }
            self.created.lock().unwrap().push(name.to_string());
            Ok(ChannelInfo {
                id: format!("CNEW-{name}"),
                name: name.to_string(),
            })
        }

        async fn set_channel_purpose(&self, _channel_id: &str, _purpose: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn project(slug: &str, path: &Path) -> Project {
        Project {
            slug: slug.to_string(),
            name: slug.to_uppercase(),
            path: path.to_path_buf(),
            channel_id: None,
            require_mention: true,
            enabled: true,
        }
    }

    fn router(dir: &TempDir, projects: Vec<Project>) -> (ChannelRouter, Arc<Database>) {
        let db = Arc::new(Database::open(dir.path()).unwrap());
        (ChannelRouter::new(ProjectRegistry::new(projects), db.clone()), db)
    }

    #[test]
    fn strip_mention_cases() {
        assert_eq!(strip_mention("pan, run the tests", "pan").as_deref(), Some("run the tests"));
        assert_eq!(strip_mention("hey Pan deploy it", "pan").as_deref(), Some("hey  deploy it"));
        assert_eq!(strip_mention("<@U123ABC> status?", "pan").as_deref(), Some("status?"));
        // Bare trigger keeps the original text.
        assert_eq!(strip_mention("pan", "pan").as_deref(), Some("pan"));
        // Substrings are not mentions.
        assert!(strip_mention("frying pancakes", "pan").is_none());
        assert!(strip_mention("nothing relevant", "pan").is_none());
    }

    #[test]
    fn channel_name_convention() {
        assert_eq!(project_channel_name("My_Api"), "pan-my-api");
    }

    #[tokio::test]
    async fn resolution_order_and_cache() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("api");
        std::fs::create_dir_all(&root).unwrap();

        let mut bound = project("api", &root);
        bound.channel_id = Some("C1".to_string());
        let dynamic = project("web", &root);
        let (router, db) = router(&dir, vec![bound, dynamic]);

        // Static config binding.
        assert_eq!(
            router.resolve_project("C1").await.unwrap().unwrap().slug,
            "api"
        );
        // Persisted dynamic mapping.
        db.map_channel("C2", "web").unwrap();
        assert_eq!(
            router.resolve_project("C2").await.unwrap().unwrap().slug,
            "web"
        );
        // Unknown channel.
        assert!(router.resolve_project("C3").await.unwrap().is_none());
        assert!(router.resolve_project("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn escaping_directory_falls_back_to_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("api");
        let sub = root.join("src");
        std::fs::create_dir_all(&sub).unwrap();
        let proj = project("api", &root);
        let (router, db) = router(&dir, vec![proj.clone()]);

        db.save_channel_state(&ChannelState {
            channel_id: "C1".to_string(),
            project_slug: "api".to_string(),
            current_directory: "/etc".into(),
            agent_session_id: None,
            last_response_marker: None,
        })
        .unwrap();
        let state = router.load_channel_state("C1", &proj).unwrap();
        assert_eq!(state.current_directory, root);

        // A valid subdirectory survives the roundtrip.
        db.save_channel_state(&ChannelState {
            channel_id: "C1".to_string(),
            project_slug: "api".to_string(),
            current_directory: sub.clone(),
            agent_session_id: None,
            last_response_marker: None,
        })
        .unwrap();
        let state = router.load_channel_state("C1", &proj).unwrap();
        assert_eq!(state.current_directory, sub);
    }

    #[tokio::test]
    async fn sync_reuses_and_creates() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("p");
        std::fs::create_dir_all(&root).unwrap();

        let existing = project("api", &root);
        let fresh = project("web", &root);
        let (router, db) = router(&dir, vec![existing, fresh]);

        let chat = MockChat {
            channels: vec![ChannelInfo {
                id: "C10".to_string(),
                name: "pan-api".to_string(),
            }],
            ..Default::default()
        };

        let result = router.sync_channels(&chat).await.unwrap();
        assert_eq!(result, SyncResult { created: 1, reused: 1, failed: 0 });
        assert_eq!(*chat.created.lock().unwrap(), vec!["pan-web"]);
        // Both mappings are persisted and resolvable.
        assert_eq!(db.project_for_channel("C10").unwrap().as_deref(), Some("api"));
        assert!(router.resolve_project("CNEW-pan-web").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sync_counts_failures() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("p");
        std::fs::create_dir_all(&root).unwrap();
        let (router, _db) = router(&dir, vec![project("web", &root)]);

        let chat = MockChat { fail_create: true, ..Default::default() };
        let result = router.sync_channels(&chat).await.unwrap();
        assert_eq!(result, SyncResult { created: 0, reused: 0, failed: 1 });
    }

    #[tokio::test]
    async fn gap_preamble_filters_bots_and_orders_oldest_first() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("p");
        std::fs::create_dir_all(&root).unwrap();
        let (router, _db) = router(&dir, vec![project("api", &root)]);

        let chat = MockChat {
            history: vec![
                HistoryEntry {
                    user: "U2".into(),
                    text: "second".into(),
                    ts: "3.0".into(),
                    is_bot: false,
                },
                HistoryEntry {
                    user: "".into(),
                    text: "bot noise".into(),
                    ts: "2.5".into(),
                    is_bot: true,
                },
                HistoryEntry {
                    user: "U1".into(),
                    text: "first".into(),
                    ts: "2.0".into(),
                    is_bot: false,
                },
            ],
            ..Default::default()
        };

        let preamble = router
            .gap_preamble(&chat, "C1", Some("1.0"))
            .await
            .unwrap()
            .unwrap();
        assert!(preamble.contains("<@U1>: first\n<@U2>: second"));
        assert!(!preamble.contains("bot noise"));
    }

    #[tokio::test]
    async fn gap_preamble_empty_when_only_bots() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("p");
        std::fs::create_dir_all(&root).unwrap();
        let (router, _db) = router(&dir, vec![project("api", &root)]);

        let chat = MockChat {
            history: vec![HistoryEntry {
                user: "".into(),
                text: "bot".into(),
                ts: "2.0".into(),
                is_bot: true,
            }],
            ..Default::default()
        };
        assert!(router
            .gap_preamble(&chat, "C1", Some("1.0"))
            .await
            .unwrap()
            .is_none());
    }
}
