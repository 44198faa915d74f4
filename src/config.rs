use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Directory of markdown rule files injected into the system prompt.
    #[serde(default)]
    pub rules_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8888 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Provider backend selector; only "anthropic" is currently supported.
    pub kind: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    /// Override the provider endpoint (useful for gateways and tests).
    pub api_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "anthropic".to_string(),
            api_key: None,
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            api_url: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthConfig {
    /// Multi-tenant mode: callers must present the identity header and RBAC
    /// checks apply.
    pub multi_user: bool,
    pub user_id_header: String,
    pub user_id_prefix: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            multi_user: false,
            user_id_header: "x-authenticated-user-email".to_string(),
            user_id_prefix: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LimitsConfig {
    pub rate_max_requests: usize,
    pub rate_window_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_max_requests: 20,
            rate_window_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub directory: Option<String>,
    pub retention_days: Option<u64>,
}

impl Config {
    /// Load the config, trying an explicit path, then `FLOWPILOT_CONFIG`,
    /// then a file next to the binary, then the user config dir. Missing
    /// everywhere means defaults.
    pub fn load_with_path(explicit: Option<PathBuf>) -> Result<(Self, Option<PathBuf>)> {
        let mut candidates = Vec::new();

        if let Some(path) = explicit {
            candidates.push(path);
        }
        if let Ok(env_path) = std::env::var("FLOWPILOT_CONFIG") {
            candidates.push(PathBuf::from(env_path));
        }
        candidates.push(PathBuf::from("flowpilot.toml"));
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("flowpilot").join("flowpilot.toml"));
        }

        for path in candidates {
            if path.exists() {
                let content = fs::read_to_string(&path)?;
                let config: Config = toml::from_str(&content)?;
                return Ok((config, Some(path)));
            }
        }

        Ok((Config::default(), None))
    }

    /// Apply environment overrides on top of the file config. Secrets are
    /// expected to come in this way rather than from disk.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(kind) = get("FLOWPILOT_PROVIDER") {
            self.provider.kind = kind;
        }
        if let Some(api_key) = get("FLOWPILOT_API_KEY") {
            self.provider.api_key = Some(api_key);
        }
        if let Some(model) = get("FLOWPILOT_MODEL") {
            self.provider.model = model;
        }
        if let Some(max_tokens) = get("FLOWPILOT_MAX_TOKENS") {
            if let Ok(v) = max_tokens.parse() {
                self.provider.max_tokens = v;
            }
        }
        if let Some(dir) = get("FLOWPILOT_RULES_DIR") {
            self.rules_dir = Some(PathBuf::from(dir));
        }
        if let Some(flag) = get("FLOWPILOT_MULTI_USER") {
            self.auth.multi_user = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(header) = get("FLOWPILOT_USER_ID_HEADER") {
            self.auth.user_id_header = header;
        }
        if let Some(prefix) = get("FLOWPILOT_USER_ID_PREFIX") {
            self.auth.user_id_prefix = prefix;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.provider.kind, "anthropic");
        assert_eq!(config.provider.max_tokens, 4096);
        assert!(!config.auth.multi_user);
        assert_eq!(config.auth.user_id_header, "x-authenticated-user-email");
        assert_eq!(config.limits.rate_max_requests, 20);
        assert_eq!(config.limits.rate_window_secs, 60);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            rules_dir = "/etc/flowpilot/rules"

            [provider]
            kind = "anthropic"
            model = "claude-test"
            max_tokens = 1024

            [auth]
            multi_user = true
            user_id_header = "x-user"
            user_id_prefix = "sso:"
            "#,
        )
        .unwrap();
        assert_eq!(config.provider.model, "claude-test");
        assert_eq!(config.provider.max_tokens, 1024);
        assert!(config.auth.multi_user);
        assert_eq!(config.auth.user_id_prefix, "sso:");
        assert_eq!(config.server.port, 8888);
        assert_eq!(
            config.rules_dir.as_deref(),
            Some(std::path::Path::new("/etc/flowpilot/rules"))
        );
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "FLOWPILOT_API_KEY" => Some("sk-test".to_string()),
            "FLOWPILOT_MODEL" => Some("claude-env".to_string()),
            "FLOWPILOT_MULTI_USER" => Some("true".to_string()),
            "FLOWPILOT_MAX_TOKENS" => Some("notanumber".to_string()),
            _ => None,
        });
        assert_eq!(config.provider.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.provider.model, "claude-env");
        assert!(config.auth.multi_user);
        // Unparseable numeric override is ignored.
        assert_eq!(config.provider.max_tokens, 4096);
    }
}
