use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_NOTION_VERSION: &str = "2022-06-28";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "taskreminder", "task-reminder")
}

fn default_data_dir() -> PathBuf {
    if let Some(path) = std::env::var_os("TASK_REMINDER_DATA_DIR") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.data_dir().to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".task-reminder")
}

fn default_credential_path() -> PathBuf {
    default_data_dir().join("auth_info.json")
}

pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("TASK_REMINDER_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.config_dir().join("config.toml");
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".task-reminder-config.toml")
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub notion: NotionConfig,
    pub data: DataConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NotionConfig {
    pub api_url: String,
    /// Companion portal hosting the relay, introspect and revoke endpoints.
    pub server_url: String,
    pub authorize_url: String,
    pub client_id: String,
    /// Only needed by the redirect handler; desktop installs leave it empty.
    pub client_secret: String,
    /// Empty means `<server_url>/api/notion/callback`.
    pub redirect_uri: String,
    pub notion_version: String,
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
    pub request_timeout_seconds: u64,
    pub status_not_started: String,
    pub status_done: String,
}

impl Default for NotionConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.notion.com".to_string(),
            server_url: "http://localhost:3000".to_string(),
            authorize_url: "https://api.notion.com/v1/oauth/authorize".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            notion_version: DEFAULT_NOTION_VERSION.to_string(),
            poll_interval_ms: 2000,
            max_poll_attempts: 60,
            request_timeout_seconds: 30,
            status_not_started: "Not started".to_string(),
            status_done: "Done".to_string(),
        }
    }
}

impl NotionConfig {
    pub fn resolve_client_id(&self) -> String {
        resolve_with_env(&self.client_id, "NOTION_CLIENT_ID")
    }

    pub fn resolve_client_secret(&self) -> String {
        resolve_with_env(&self.client_secret, "NOTION_CLIENT_SECRET")
    }

    pub fn resolve_redirect_uri(&self) -> String {
        let configured = self.redirect_uri.trim();
        if !configured.is_empty() {
            return configured.to_string();
        }
        format!("{}/api/notion/callback", self.server_url.trim_end_matches('/'))
    }
}

fn resolve_with_env(configured: &str, var: &str) -> String {
    let configured = configured.trim();
    if !configured.is_empty() {
        return configured.to_string();
    }
    std::env::var(var)
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DataConfig {
    pub credential_path: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            credential_path: default_credential_path(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        Self::load_from_path(&config_path())
    }

    pub fn load_from_path(config_path: &Path) -> Self {
        let mut config = if let Ok(content) = fs::read_to_string(config_path) {
            match toml::from_str::<Config>(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Failed to parse config.toml ({config_path:?}), using defaults: {e}");
                    Config::default()
                }
            }
        } else {
            Config::default()
        };

        let changed = config.normalize();

        if changed || !config_path.exists() {
            if let Err(e) = config.save_to_path(config_path) {
                warn!("Failed to write config.toml ({config_path:?}): {e}");
            }
        }

        config
    }

    pub fn save_to_path(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, content)
    }

    fn normalize(&mut self) -> bool {
        let mut changed = false;

        if self.data.credential_path.as_os_str().is_empty() {
            self.data.credential_path = default_credential_path();
            changed = true;
        }

        if self.data.credential_path.is_relative() {
            self.data.credential_path = default_data_dir().join(&self.data.credential_path);
            changed = true;
        }

        if self.notion.notion_version.trim().is_empty() {
            self.notion.notion_version = DEFAULT_NOTION_VERSION.to_string();
            changed = true;
        }

        if self.notion.max_poll_attempts == 0 {
            self.notion.max_poll_attempts = NotionConfig::default().max_poll_attempts;
            changed = true;
        }

        if self.logging.level.trim().is_empty() {
            self.logging.level = LoggingConfig::default().level;
            changed = true;
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_dir;

    #[test]
    fn missing_file_writes_defaults() {
        let path = temp_dir().join("config.toml");
        let config = Config::load_from_path(&path);
        assert!(path.exists());
        assert_eq!(config.notion.poll_interval_ms, 2000);
        assert_eq!(config.notion.max_poll_attempts, 60);
        assert_eq!(config.notion.notion_version, "2022-06-28");
        assert!(config.data.credential_path.ends_with("auth_info.json"));
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let path = temp_dir().join("config.toml");
        fs::write(&path, "[notion\nbroken").expect("write");
        let config = Config::load_from_path(&path);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let path = temp_dir().join("config.toml");
        fs::write(
            &path,
            "[notion]\nserver_url = \"https://portal.example/\"\nmax_poll_attempts = 0\n",
        )
        .expect("write");
        let config = Config::load_from_path(&path);
        assert_eq!(config.notion.max_poll_attempts, 60);
        assert_eq!(
            config.notion.resolve_redirect_uri(),
            "https://portal.example/api/notion/callback"
        );
        assert_eq!(config.notion.api_url, "https://api.notion.com");
    }

    #[test]
    fn relative_credential_path_is_anchored() {
        let mut config = Config::default();
        config.data.credential_path = PathBuf::from("auth.json");
        assert!(config.normalize());
        assert_ne!(config.data.credential_path, PathBuf::from("auth.json"));
        assert!(config.data.credential_path.ends_with("auth.json"));
    }

    #[test]
    fn explicit_values_win_over_env() {
        let notion = NotionConfig {
            client_id: " configured ".to_string(),
            redirect_uri: "https://example.test/cb".to_string(),
            ..NotionConfig::default()
        };
        assert_eq!(notion.resolve_client_id(), "configured");
        assert_eq!(notion.resolve_redirect_uri(), "https://example.test/cb");
    }
}
