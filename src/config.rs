use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;

pub const ENV_ENDPOINT: &str = "SERVING_ENDPOINT";
pub const ENV_HOST: &str = "DATABRICKS_HOST";
pub const ENV_TOKEN: &str = "DATABRICKS_TOKEN";

const DEFAULT_EXAMPLE_PROMPTS: [&str; 5] = [
    "Compare Brachiaria species for drought tolerance",
    "Best tropical forages for acidic soils",
    "Climate adaptation strategies for forage systems",
    "Tell me about the journal",
    "Hello, what can you do?",
];

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub serving: ServingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub slack: Option<SlackConfig>,
}

#[derive(Deserialize, Clone, Default)]
pub struct ServingConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_example_prompts")]
    pub example_prompts: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Deserialize, Clone)]
pub struct SlackConfig {
    pub bot_token: String,
    pub app_token: String,
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    /// Thread sessions untouched for this long are dropped.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            example_prompts: default_example_prompts(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl fmt::Debug for ServingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServingConfig")
            .field("endpoint", &self.endpoint)
            .field("host", &self.host)
            .field("token", &redacted(&self.token))
            .finish()
    }
}

impl fmt::Debug for SlackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlackConfig")
            .field("bot_token", &redacted(&self.bot_token))
            .field("app_token", &redacted(&self.app_token))
            .field("update_interval_ms", &self.update_interval_ms)
            .field("session_idle_secs", &self.session_idle_secs)
            .finish()
    }
}

impl Config {
    /// Reads the optional config file, then lets the environment override the
    /// serving settings. A missing file is not an error.
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            toml::from_str(&content).context("failed to parse config toml")?
        } else {
            Config::default()
        };
        cfg.serving.apply_env(|key| std::env::var(key).ok());
        cfg.serving.validate()?;
        Ok(cfg)
    }

    pub fn slack(&self) -> Result<&SlackConfig> {
        let slack = self
            .slack
            .as_ref()
            .context("the [slack] section is required to run the Slack bot")?;
        if slack.bot_token.trim().is_empty() || slack.app_token.trim().is_empty() {
            bail!("slack.bot_token and slack.app_token are required");
        }
        Ok(slack)
    }
}

impl ServingConfig {
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let pick = |key: &str, current: &mut String| {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *current = value;
            }
        };
        pick(ENV_ENDPOINT, &mut self.endpoint);
        pick(ENV_HOST, &mut self.host);
        pick(ENV_TOKEN, &mut self.token);
    }

    fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            bail!(
                "missing configuration: {ENV_ENDPOINT}\n\
                 Set the {ENV_ENDPOINT} environment variable or `endpoint` under [serving] \
                 in the config file to the name of your Databricks serving endpoint."
            );
        }
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push(ENV_HOST);
        }
        if self.token.trim().is_empty() {
            missing.push(ENV_TOKEN);
        }
        if !missing.is_empty() {
            bail!(
                "missing Databricks authentication: {}\n\
                 Set {ENV_HOST} (workspace URL) and {ENV_TOKEN} (personal access token) in the \
                 environment, or `host` and `token` under [serving] in the config file.",
                missing.join(", ")
            );
        }
        Ok(())
    }
}

fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() { "<unset>" } else { "***" }
}

fn default_example_prompts() -> Vec<String> {
    DEFAULT_EXAMPLE_PROMPTS.iter().map(|p| p.to_string()).collect()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_update_interval_ms() -> u64 {
    750
}

fn default_session_idle_secs() -> u64 {
    24 * 60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn serving(endpoint: &str, host: &str, token: &str) -> ServingConfig {
        ServingConfig {
            endpoint: endpoint.to_string(),
            host: host.to_string(),
            token: token.to_string(),
        }
    }

    #[test]
    fn test_parse_full_config() {
        let cfg: Config = toml::from_str(
            r#"
            [serving]
            endpoint = "forages-rag"
            host = "https://adb-1.azuredatabricks.net"
            token = "dapi123"

            [chat]
            example_prompts = ["What is Leucaena?"]

            [slack]
            bot_token = "xoxb-1"
            app_token = "xapp-1"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.serving.endpoint, "forages-rag");
        assert_eq!(cfg.chat.example_prompts, vec!["What is Leucaena?".to_string()]);
        assert_eq!(cfg.chat.request_timeout_secs, 120);
        assert_eq!(cfg.slack().unwrap().update_interval_ms, 750);
        assert_eq!(cfg.slack().unwrap().session_idle_secs, 86_400);
    }

    #[test]
    fn test_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.chat.example_prompts.len(), 5);
        assert!(cfg.slack().is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_ENDPOINT, "from-env"),
            (ENV_TOKEN, "  "),
        ]);
        let mut cfg = serving("from-file", "host", "file-token");
        cfg.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(cfg.endpoint, "from-env");
        assert_eq!(cfg.host, "host");
        assert_eq!(cfg.token, "file-token");
    }

    #[test]
    fn test_validate_reports_missing_keys() {
        let err = serving("", "h", "t").validate().unwrap_err();
        assert!(err.to_string().contains(ENV_ENDPOINT));

        let err = serving("e", "", "").validate().unwrap_err();
        assert!(err.to_string().contains("DATABRICKS_HOST, DATABRICKS_TOKEN"));

        assert!(serving("e", "h", "t").validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_token() {
        let debug = format!("{:?}", serving("e", "h", "dapi-secret"));
        assert!(!debug.contains("dapi-secret"));
        assert!(debug.contains("***"));
    }
}
