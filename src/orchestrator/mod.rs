//! Glue between events, routing, the agent and Slack.
//!
//! The orchestrator is the bus subscriber for `UserMessage`,
//! `Scheduled` and `Webhook` events.  User replies go out directly so
//! the reply timestamp can be stored as the channel's position marker;
//! scheduled and webhook results are published as `AgentResponse`
//! events and flow through the paced delivery queue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::agent::{AgentCallbacks, AgentRequest, AgentRunner, NoCallbacks};
use crate::events::{
    AgentResponseEvent, Event, EventBus, EventHandler, EventMeta, ScheduledEvent,
    UserMessageEvent, WebhookEvent,
};
use crate::notify::{split_message, MAX_MESSAGE_LEN};
use crate::rendezvous::{PendingQuestions, Question};
use crate::router::{guidance_message, strip_mention, ChannelRouter};
use crate::scheduler::{JobScheduler, NewJob};
use crate::slack::ChatApi;
use crate::storage::Database;

pub struct Orchestrator {
    chat: Arc<dyn ChatApi>,
    router: Arc<ChannelRouter>,
    agent: Arc<dyn AgentRunner>,
    scheduler: Arc<JobScheduler>,
    pending: Arc<PendingQuestions>,
    bus: Arc<EventBus>,
    db: Arc<Database>,
    bot_name: String,
    default_working_directory: PathBuf,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat: Arc<dyn ChatApi>,
        router: Arc<ChannelRouter>,
        agent: Arc<dyn AgentRunner>,
        scheduler: Arc<JobScheduler>,
        pending: Arc<PendingQuestions>,
        bus: Arc<EventBus>,
        db: Arc<Database>,
        bot_name: String,
        default_working_directory: PathBuf,
    ) -> Self {
        Self {
            chat,
            router,
            agent,
            scheduler,
            pending,
            bus,
            db,
            bot_name,
            default_working_directory,
        }
    }

    /// Forget the agent session for a channel; the next message starts
    /// a fresh conversation in the same project.
    pub fn reset_session(&self, channel_id: &str) -> anyhow::Result<bool> {
        let cleared = self.db.clear_session(channel_id)?;
        if cleared {
            info!(channel_id, "agent session reset");
        }
        Ok(cleared)
    }

    async fn handle_user_message(&self, event: &UserMessageEvent) -> anyhow::Result<()> {
        let Some(project) = self.router.resolve_project(&event.channel_id).await? else {
            // Unrouted channel: explain instead of silently ignoring.
            if let Err(e) = self
                .chat
                .send_message(&event.channel_id, guidance_message())
                .await
            {
                warn!(channel_id = %event.channel_id, error = %e,
                      "failed to send routing guidance");
            }
            return Ok(());
        };

        let gated = project.require_mention && !self.chat.is_direct(&event.channel_id);
        let text = if gated {
            match strip_mention(&event.text, &self.bot_name) {
                Some(text) => text,
                // Not addressed to the bot.
                None => return Ok(()),
            }
        } else {
            event.text.clone()
        };

        if text.trim() == "/new" {
            self.reset_session(&event.channel_id)?;
            if let Err(e) = self
                .chat
                .send_message(&event.channel_id, "Session reset. What's next?")
                .await
            {
                warn!(channel_id = %event.channel_id, error = %e,
                      "failed to confirm session reset");
            }
            return Ok(());
        }

        let mut state = self.router.load_channel_state(&event.channel_id, &project)?;

        let mut prompt = text;
        if gated {
            match self
                .router
                .gap_preamble(
                    self.chat.as_ref(),
                    &event.channel_id,
                    state.last_response_marker.as_deref(),
                )
                .await
            {
                Ok(Some(preamble)) => prompt = format!("{preamble}{prompt}"),
                Ok(None) => {}
                Err(e) => warn!(channel_id = %event.channel_id, error = %e,
                                "failed to fetch gap context"),
            }
        }

        let request = AgentRequest {
            prompt,
            working_directory: state.current_directory.clone(),
            session_id: state.agent_session_id.clone(),
        };
        let callbacks: Arc<dyn AgentCallbacks> = Arc::new(ChannelCallbacks {
            chat: self.chat.clone(),
            pending: self.pending.clone(),
            scheduler: self.scheduler.clone(),
            channel_id: event.channel_id.clone(),
            user_id: event.user_id.clone(),
            working_directory: state.current_directory.clone(),
        });

        let reply = match self.agent.run(&request, callbacks).await {
            Ok(outcome) => {
                if outcome.session_id.is_some() {
                    state.agent_session_id = outcome.session_id.clone();
                }
                outcome.content
            }
            Err(e) => {
                warn!(channel_id = %event.channel_id, error = %e, "agent run failed");
                format!(":warning: Agent run failed: {e}")
            }
        };

        if !reply.trim().is_empty() {
            match self.send_reply(&event.channel_id, &reply).await {
                Ok(Some(ts)) => state.last_response_marker = Some(ts),
                Ok(None) => {}
                Err(e) => warn!(channel_id = %event.channel_id, error = %e,
                                "failed to deliver reply"),
            }
        }

        // State is persisted whether the run succeeded or not.
        self.router.save_channel_state(&state, &project)?;
        Ok(())
    }

    /// Send a (possibly split) reply and return the last message's ts.
    async fn send_reply(&self, channel_id: &str, text: &str) -> anyhow::Result<Option<String>> {
        let mut last_ts = None;
        for part in split_message(text, MAX_MESSAGE_LEN) {
            last_ts = Some(self.chat.send_message(channel_id, &part).await?);
        }
        Ok(last_ts)
    }

    async fn handle_scheduled(&self, event: &ScheduledEvent) -> anyhow::Result<()> {
        let prompt = match &event.skill_name {
            Some(skill) if event.prompt.is_empty() => format!("/{skill}"),
            Some(skill) => format!("/{skill}\n\n{}", event.prompt),
            None => event.prompt.clone(),
        };

        if event.target_channel_ids.is_empty() {
            // Standalone run; the result broadcasts to the default
            // notification channels.
            let request = AgentRequest {
                prompt,
                working_directory: event.working_directory.clone(),
                session_id: None,
            };
            match self.agent.run(&request, Arc::new(NoCallbacks)).await {
                Ok(outcome) if !outcome.content.trim().is_empty() => {
                    self.publish_response("", &outcome.content, &event.meta.id).await;
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = %event.job_id, error = %e,
                                "scheduled agent run failed"),
            }
            return Ok(());
        }

        for channel_id in &event.target_channel_ids {
            if let Err(e) = self.run_scheduled_for_channel(event, &prompt, channel_id).await {
                warn!(job_id = %event.job_id, channel_id = %channel_id, error = %e,
                      "scheduled run failed for channel");
            }
        }
        Ok(())
    }

    /// Run a scheduled prompt inside a channel's conversation so the
    /// job and the user share context.
    async fn run_scheduled_for_channel(
        &self,
        event: &ScheduledEvent,
        prompt: &str,
        channel_id: &str,
    ) -> anyhow::Result<()> {
        let project = self.router.resolve_project(channel_id).await?;

        let (mut state, working_directory, session_id) = match &project {
            Some(project) => {
                let state = self.router.load_channel_state(channel_id, project)?;
                let wd = state.current_directory.clone();
                let sid = state.agent_session_id.clone();
                (Some(state), wd, sid)
            }
            None => (None, event.working_directory.clone(), None),
        };

        let request = AgentRequest {
            prompt: prompt.to_string(),
            working_directory,
            session_id,
        };
        let outcome = self.agent.run(&request, Arc::new(NoCallbacks)).await?;

        if let (Some(state), Some(project)) = (state.as_mut(), project.as_ref()) {
            if outcome.session_id.is_some() {
                state.agent_session_id = outcome.session_id.clone();
            }
            self.router.save_channel_state(state, project)?;
        }

        if !outcome.content.trim().is_empty() {
            self.publish_response(channel_id, &outcome.content, &event.meta.id)
                .await;
        }
        Ok(())
    }

    async fn handle_webhook(&self, event: &WebhookEvent) -> anyhow::Result<()> {
        let prompt = build_webhook_prompt(event);
        let request = AgentRequest {
            prompt,
            working_directory: self.default_working_directory.clone(),
            session_id: None,
        };
        let outcome = self.agent.run(&request, Arc::new(NoCallbacks)).await?;
        if !outcome.content.trim().is_empty() {
            self.publish_response("", &outcome.content, &event.meta.id).await;
        }
        Ok(())
    }

    async fn publish_response(&self, channel_id: &str, text: &str, origin: &str) {
        self.bus
            .publish(Event::AgentResponse(AgentResponseEvent {
                meta: EventMeta::new("orchestrator"),
                channel_id: channel_id.to_string(),
                text: text.to_string(),
                originating_event_id: Some(origin.to_string()),
            }))
            .await;
    }
}

#[async_trait]
impl EventHandler for Orchestrator {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match event {
            Event::UserMessage(e) => self.handle_user_message(e).await,
            Event::Scheduled(e) => self.handle_scheduled(e).await,
            Event::Webhook(e) => self.handle_webhook(e).await,
            Event::AgentResponse(_) => Ok(()),
        }
    }
}

/// Callbacks for a run triggered from a channel: interactive questions
/// plus the scheduling tool surface.
struct ChannelCallbacks {
    chat: Arc<dyn ChatApi>,
    pending: Arc<PendingQuestions>,
    scheduler: Arc<JobScheduler>,
    channel_id: String,
    user_id: String,
    working_directory: PathBuf,
}

#[async_trait]
impl AgentCallbacks for ChannelCallbacks {
    async fn ask_user(&self, questions: &[Question]) -> HashMap<String, String> {
        self.pending
            .ask(self.chat.as_ref(), &self.channel_id, &self.user_id, questions)
            .await
    }

    async fn tool_call(&self, name: &str, args: &Value) -> anyhow::Result<Option<String>> {
        match name {
            "schedule_job" => {
                let job = self
                    .scheduler
                    .add_job(NewJob {
                        job_name: str_arg(args, "job_name")?.to_string(),
                        cron_expression: str_arg(args, "cron_expression")?.to_string(),
                        prompt: str_arg(args, "prompt")?.to_string(),
                        target_channel_ids: vec![self.channel_id.clone()],
                        working_directory: self.working_directory.clone(),
                        skill_name: args["skill_name"].as_str().map(str::to_string),
                        created_by: self.user_id.clone(),
                    })
                    .await?;
                Ok(Some(format!(
                    "Scheduled '{}' ({}) with schedule '{}'",
                    job.job_name, job.job_id, job.cron_expression
                )))
            }
            "list_jobs" => {
                let jobs = self.scheduler.list_jobs()?;
                Ok(Some(serde_json::to_string_pretty(&jobs)?))
            }
            "remove_job" => {
                let job_id = str_arg(args, "job_id")?;
                let removed = self.scheduler.remove_job(job_id).await?;
                Ok(Some(if removed {
                    format!("Removed job {job_id}")
                } else {
                    format!("No active job with id {job_id}")
                }))
            }
            "upload_file" => {
                let filename = str_arg(args, "filename")?;
                let content = args["content"].as_str().unwrap_or_default();
                self.chat
                    .upload_file(&self.channel_id, filename, content)
                    .await?;
                Ok(Some(format!("Uploaded {filename}")))
            }
            _ => Ok(None),
        }
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args[key]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing tool argument '{key}'"))
}

/// Turn a webhook delivery into an agent prompt.
fn build_webhook_prompt(event: &WebhookEvent) -> String {
    let mut lines = Vec::new();
    flatten_value(&event.payload, "", 0, 2, &mut lines);
    let mut summary = lines.join("\n");
    if summary.len() > 2000 {
        summary.truncate(crate::utils::floor_char_boundary(&summary, 2000));
        summary.push_str("\n... (truncated)");
    }

    format!(
        "A {} webhook event occurred.\nEvent type: {}\nPayload summary:\n{}\n\n\
         Analyze this event and provide a concise summary. \
         Highlight anything that needs my attention.",
        event.provider, event.event_type_name, summary
    )
}

fn flatten_value(value: &Value, prefix: &str, depth: usize, max_depth: usize, lines: &mut Vec<String>) {
    if depth >= max_depth {
        lines.push(format!("{prefix}: ..."));
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                let full_key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match val {
                    Value::Object(_) | Value::Array(_) => {
                        flatten_value(val, &full_key, depth + 1, max_depth, lines)
                    }
                    _ => lines.push(format!("{full_key}: {}", scalar_str(val))),
                }
            }
        }
        Value::Array(items) => {
            lines.push(format!("{prefix}: [{} items]", items.len()));
            for (i, item) in items.iter().take(3).enumerate() {
                flatten_value(item, &format!("{prefix}[{i}]"), depth + 1, max_depth, lines);
            }
        }
        _ => lines.push(format!("{prefix}: {}", scalar_str(value))),
    }
}

fn scalar_str(value: &Value) -> String {
    let s = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    crate::utils::truncate_str(&s, 200)
}
