//! YAML configuration.
//!
//! Secrets may be given inline or as `$ENV_VAR` references, resolved at
//! load time.  Relative project paths resolve against the approved
//! directory; `validate()` covers the semantic constraints serde cannot
//! enforce.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::router::Project;

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Trigger word for mention-gated channels.
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    pub slack: SlackConfig,
    /// All project paths must live under this directory.
    pub approved_directory: PathBuf,
    /// IANA timezone name for job schedules.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// SQLite file location.  Defaults to `<panbot home>/panbot.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Broadcast targets for responses with no originating channel.
    #[serde(default)]
    pub notification_channel_ids: Vec<String>,
    /// HTTP ingress bind address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Shared secret for `POST /webhook/:provider`; unset disables the check.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub claude: ClaudeConfig,
    #[serde(default)]
    pub projects: Vec<Project>,
}

/// Slack credentials.  Both accept `$ENV_VAR` references.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlackConfig {
    pub bot_token: String,
    /// Request-signature secret.  Empty disables verification.
    #[serde(default)]
    pub signing_secret: String,
}

/// Agent backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaudeConfig {
    #[serde(default = "default_claude_binary")]
    pub binary: String,
    #[serde(default = "default_claude_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_claude_max_turns")]
    pub max_turns: u32,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            binary: default_claude_binary(),
            timeout_secs: default_claude_timeout_secs(),
            max_turns: default_claude_max_turns(),
        }
    }
}

fn default_bot_name() -> String {
    "pan".to_string()
}

fn default_timezone() -> String {
    "America/Los_Angeles".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_claude_binary() -> String {
    "claude".to_string()
}

fn default_claude_timeout_secs() -> u64 {
    300
}

fn default_claude_max_turns() -> u32 {
    30
}

impl Config {
    /// Read and parse a YAML configuration file.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_yaml(&contents)
    }

    /// Parse, resolve secrets and relative paths, and validate.
    pub fn from_yaml(contents: &str) -> anyhow::Result<Config> {
        let mut config: Config =
            serde_yaml::from_str(contents).context("failed to parse config YAML")?;

        config.slack.bot_token =
            resolve_secret(&config.slack.bot_token).context("slack.bot_token")?;
        config.slack.signing_secret =
            resolve_secret(&config.slack.signing_secret).context("slack.signing_secret")?;
        if let Some(secret) = &config.webhook_secret {
            config.webhook_secret = Some(resolve_secret(secret).context("webhook_secret")?);
        }

        for project in &mut config.projects {
            if project.path.is_relative() {
                project.path = config.approved_directory.join(&project.path);
            }
        }

        config.validate()?;
        tracing::debug!(
            projects = config.projects.len(),
            timezone = %config.timezone,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Validate semantic constraints that serde cannot enforce.
    fn validate(&self) -> anyhow::Result<()> {
        use std::collections::HashSet;

        if self.slack.bot_token.trim().is_empty() {
            anyhow::bail!("config: slack.bot_token is empty");
        }
        if self.approved_directory.as_os_str().is_empty() {
            anyhow::bail!("config: approved_directory is empty");
        }

        self.tz()?;

        let mut slugs = HashSet::new();
        for project in &self.projects {
            if project.slug.trim().is_empty() {
                anyhow::bail!("config: project with empty slug");
            }
            if !slugs.insert(project.slug.as_str()) {
                anyhow::bail!("config: duplicate project slug: {}", project.slug);
            }
            if !project.path.starts_with(&self.approved_directory) {
                anyhow::bail!(
                    "config: project '{}' path {} escapes approved directory {}",
                    project.slug,
                    project.path.display(),
                    self.approved_directory.display()
                );
            }
        }

        Ok(())
    }

    /// Parsed scheduler timezone.
    pub fn tz(&self) -> anyhow::Result<chrono_tz::Tz> {
        self.timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("config: unknown timezone '{}'", self.timezone))
    }

    /// Effective SQLite file path.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| crate::panbot_home().join("panbot.db"))
    }
}

/// A `$NAME` value reads the environment; anything else is literal.
fn resolve_secret(value: &str) -> anyhow::Result<String> {
    match value.strip_prefix('$') {
        Some(var) if !var.is_empty() => std::env::var(var)
            .with_context(|| format!("environment variable '{var}' is not set")),
        _ => Ok(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
slack:
  bot_token: xoxb-test
approved_directory: /srv/projects
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.bot_name, "pan");
        assert_eq!(config.timezone, "America/Los_Angeles");
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.claude.binary, "claude");
        assert_eq!(config.claude.timeout_secs, 300);
        assert!(config.projects.is_empty());
        config.tz().unwrap();
    }

    #[test]
    fn relative_project_paths_resolve_against_root() {
        let yaml = r#"
slack:
  bot_token: xoxb-test
approved_directory: /srv/projects
projects:
  - slug: api
    name: API
    path: api
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.projects[0].path, PathBuf::from("/srv/projects/api"));
        assert!(config.projects[0].enabled);
    }

    #[test]
    fn escaping_project_path_rejected() {
        let yaml = r#"
slack:
  bot_token: xoxb-test
approved_directory: /srv/projects
projects:
  - slug: api
    name: API
    path: /etc/api
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn duplicate_slugs_rejected() {
        let yaml = r#"
slack:
  bot_token: xoxb-test
approved_directory: /srv/projects
projects:
  - slug: api
    name: API
    path: api
  - slug: api
    name: API again
    path: api2
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn unknown_timezone_rejected() {
        let yaml = r#"
slack:
  bot_token: xoxb-test
approved_directory: /srv/projects
timezone: Mars/Olympus
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn env_secret_resolution() {
        std::env::set_var("PANBOT_TEST_TOKEN", "xoxb-from-env");
        let yaml = r#"
slack:
  bot_token: $PANBOT_TEST_TOKEN
approved_directory: /srv/projects
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.slack.bot_token, "xoxb-from-env");

        let missing = r#"
slack:
  bot_token: $PANBOT_TEST_TOKEN_MISSING
approved_directory: /srv/projects
"#;
        assert!(Config::from_yaml(missing).is_err());
    }
}
