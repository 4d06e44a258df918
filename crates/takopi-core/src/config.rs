use std::collections::HashMap;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TakopiError};
use crate::ids::is_valid_id;

pub const DEFAULT_TRANSPORT: &str = "telegram";
pub const DEFAULT_WORKTREES_DIR: &str = ".worktrees";

/// Top-level config (takopi.toml + TAKOPI_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakopiConfig {
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_engine")]
    pub default_engine: String,
    #[serde(default)]
    pub default_project: Option<String>,
    #[serde(default)]
    pub projects: HashMap<String, ProjectEntry>,
    #[serde(default)]
    pub transports: TransportsConfig,
    /// Freeform per-engine tables, passed through to the engine backends.
    #[serde(default)]
    pub engines: HashMap<String, serde_json::Value>,
    /// Freeform per-plugin tables, handed to command backends at dispatch.
    #[serde(default)]
    pub plugins: HashMap<String, serde_json::Value>,
}

impl Default for TakopiConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            default_engine: default_engine(),
            default_project: None,
            projects: HashMap::new(),
            transports: TransportsConfig::default(),
            engines: HashMap::new(),
            plugins: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub path: PathBuf,
    #[serde(default = "default_worktrees_dir")]
    pub worktrees_dir: PathBuf,
    #[serde(default)]
    pub worktree_base: Option<String>,
    #[serde(default)]
    pub default_engine: Option<String>,
    /// Dedicated chat for this project. Messages in this chat default to it.
    #[serde(default)]
    pub chat_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportsConfig {
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: i64,
    #[serde(default)]
    pub chat_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub voice_transcription: VoiceTranscriptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Save bare document uploads without requiring an explicit `/file put`.
    #[serde(default = "bool_true")]
    pub auto_put: bool,
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
    #[serde(default)]
    pub allowed_user_ids: Vec<i64>,
    #[serde(default = "default_deny_globs")]
    pub deny_globs: Vec<String>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_put: true,
            uploads_dir: default_uploads_dir(),
            max_upload_bytes: default_max_upload_bytes(),
            max_download_bytes: default_max_download_bytes(),
            allowed_user_ids: Vec::new(),
            deny_globs: default_deny_globs(),
        }
    }
}

/// Which chats may use forum-topic commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicsScope {
    Main,
    Projects,
    All,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_topics_scope")]
    pub scope: TopicsScope,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scope: default_topics_scope(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceTranscriptionConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn bool_true() -> bool {
    true
}
fn default_transport() -> String {
    DEFAULT_TRANSPORT.to_string()
}
fn default_engine() -> String {
    "codex".to_string()
}
fn default_worktrees_dir() -> PathBuf {
    PathBuf::from(DEFAULT_WORKTREES_DIR)
}
fn default_uploads_dir() -> String {
    "incoming".to_string()
}
fn default_max_upload_bytes() -> u64 {
    20 * 1024 * 1024
}
fn default_max_download_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_deny_globs() -> Vec<String> {
    [".git/**", ".env", ".envrc", "**/*.pem", "**/.ssh/**"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_topics_scope() -> TopicsScope {
    TopicsScope::Auto
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".takopi").join("takopi.toml")
}

/// State file lives next to the config so both move together.
pub fn resolve_state_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name("takopi-state.json")
}

impl TakopiConfig {
    /// Load config from a TOML file with TAKOPI_* env var overrides.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.is_file() {
            if config_path.exists() {
                return Err(TakopiError::Config(format!(
                    "Config path {} exists but is not a file.",
                    config_path.display()
                )));
            }
            return Err(TakopiError::Config(format!(
                "Missing config file {}.",
                config_path.display()
            )));
        }
        Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("TAKOPI_").split("__"))
            .extract()
            .map_err(|e| TakopiError::Config(e.to_string()))
    }

    pub fn telegram(&self, config_path: &Path) -> Result<&TelegramConfig> {
        self.transports.telegram.as_ref().ok_or_else(|| {
            TakopiError::Config(format!(
                "Missing `[transports.telegram]` in {}.",
                config_path.display()
            ))
        })
    }

    /// Validate the project tables against the known engine ids and reserved
    /// command names, producing the lookup view used by the resolver.
    pub fn to_projects(
        &self,
        config_path: &Path,
        engine_ids: &[String],
        reserved: &[&str],
    ) -> Result<ProjectsConfig> {
        let engine_set: Vec<String> = engine_ids.iter().map(|e| e.to_lowercase()).collect();
        let mut projects = HashMap::new();
        let mut chat_map = HashMap::new();
        for (alias, entry) in &self.projects {
            let key = alias.to_lowercase();
            if !is_valid_id(&key) {
                return Err(TakopiError::Config(format!(
                    "Invalid project alias {alias:?} in {}; use letters, digits, _ or -.",
                    config_path.display()
                )));
            }
            if engine_set.contains(&key) {
                return Err(TakopiError::Config(format!(
                    "Invalid project alias {alias:?} in {}; aliases must not match engine ids.",
                    config_path.display()
                )));
            }
            if reserved.iter().any(|r| r.eq_ignore_ascii_case(&key)) {
                return Err(TakopiError::Config(format!(
                    "Invalid project alias {alias:?} in {}; aliases must not match reserved commands.",
                    config_path.display()
                )));
            }
            if let Some(chat_id) = entry.chat_id {
                chat_map.insert(chat_id, key.clone());
            }
            projects.insert(
                key,
                ProjectConfig {
                    alias: alias.clone(),
                    path: entry.path.clone(),
                    worktrees_dir: entry.worktrees_dir.clone(),
                    worktree_base: entry.worktree_base.clone(),
                    default_engine: entry.default_engine.as_ref().map(|e| e.to_lowercase()),
                    chat_id: entry.chat_id,
                },
            );
        }
        let default_project = match &self.default_project {
            Some(alias) => {
                let key = alias.to_lowercase();
                if !projects.contains_key(&key) {
                    return Err(TakopiError::Config(format!(
                        "Unknown `default_project` {alias:?} in {}.",
                        config_path.display()
                    )));
                }
                Some(key)
            }
            None => None,
        };
        Ok(ProjectsConfig {
            projects,
            default_project,
            chat_map,
        })
    }
}

/// A validated project table entry, keyed by its lowercased alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Alias as written in the config (display form).
    pub alias: String,
    pub path: PathBuf,
    pub worktrees_dir: PathBuf,
    pub worktree_base: Option<String>,
    pub default_engine: Option<String>,
    pub chat_id: Option<i64>,
}

/// Lookup view over the validated project tables.
#[derive(Debug, Clone, Default)]
pub struct ProjectsConfig {
    pub projects: HashMap<String, ProjectConfig>,
    pub default_project: Option<String>,
    pub chat_map: HashMap<i64, String>,
}

impl ProjectsConfig {
    pub fn get(&self, key: &str) -> Option<&ProjectConfig> {
        self.projects.get(&key.to_lowercase())
    }

    /// Normalize a user-supplied project token to its config key.
    pub fn normalize_key(&self, token: &str) -> Option<String> {
        let key = token.to_lowercase();
        self.projects.contains_key(&key).then_some(key)
    }

    pub fn alias_for_key(&self, key: &str) -> String {
        self.projects
            .get(key)
            .map(|p| p.alias.clone())
            .unwrap_or_else(|| key.to_string())
    }

    pub fn project_for_chat(&self, chat_id: Option<i64>) -> Option<&str> {
        chat_id
            .and_then(|id| self.chat_map.get(&id))
            .map(String::as_str)
    }

    pub fn project_chat_ids(&self) -> Vec<i64> {
        self.chat_map.keys().copied().collect()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.projects.values().map(|p| p.alias.clone()).collect()
    }
}

/// Read the raw config document for in-place edits (`takopi init`).
pub fn read_raw_toml(path: &Path) -> Result<toml::Table> {
    if path.exists() && !path.is_file() {
        return Err(TakopiError::Config(format!(
            "Config path {} exists but is not a file.",
            path.display()
        )));
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TakopiError::Config(format!(
                "Missing config file {}.",
                path.display()
            )))
        }
        Err(e) => {
            return Err(TakopiError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            )))
        }
    };
    raw.parse::<toml::Table>().map_err(|e| {
        TakopiError::Config(format!("Malformed TOML in {}: {e}", path.display()))
    })
}

pub fn write_raw_toml(config: &toml::Table, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(config).map_err(|e| {
        TakopiError::Config(format!("Failed to serialise config: {e}"))
    })?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("takopi.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn load_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
default_engine = "codex"

[transports.telegram]
bot_token = "123:abc"
chat_id = 42
"#,
        );
        let cfg = TakopiConfig::load(&path).unwrap();
        assert_eq!(cfg.transport, "telegram");
        assert_eq!(cfg.default_engine, "codex");
        let tg = cfg.telegram(&path).unwrap();
        assert_eq!(tg.chat_id, 42);
        assert!(!tg.files.enabled);
        assert!(tg.files.auto_put);
        assert_eq!(tg.topics.scope, TopicsScope::Auto);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TakopiConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Missing config file"));
    }

    #[test]
    fn projects_validation_rejects_engine_collision() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[projects.codex]
path = "/tmp/repo"

[transports.telegram]
bot_token = "t"
chat_id = 1
"#,
        );
        let cfg = TakopiConfig::load(&path).unwrap();
        let err = cfg
            .to_projects(&path, &["codex".into()], &["cancel"])
            .unwrap_err();
        assert!(err.to_string().contains("must not match engine ids"));
    }

    #[test]
    fn projects_chat_map_and_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
default_project = "MyProj"

[projects.MyProj]
path = "/tmp/repo"
chat_id = -100

[transports.telegram]
bot_token = "t"
chat_id = 1
"#,
        );
        let cfg = TakopiConfig::load(&path).unwrap();
        let projects = cfg.to_projects(&path, &[], &[]).unwrap();
        assert_eq!(projects.default_project.as_deref(), Some("myproj"));
        assert_eq!(projects.project_for_chat(Some(-100)), Some("myproj"));
        assert_eq!(projects.alias_for_key("myproj"), "MyProj");
        assert_eq!(projects.normalize_key("MYPROJ").as_deref(), Some("myproj"));
    }

    #[test]
    fn raw_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "default_engine = \"codex\"\n");
        let mut raw = read_raw_toml(&path).unwrap();
        raw.insert("default_project".into(), toml::Value::String("z80".into()));
        write_raw_toml(&raw, &path).unwrap();
        let again = read_raw_toml(&path).unwrap();
        assert_eq!(
            again.get("default_project").and_then(|v| v.as_str()),
            Some("z80")
        );
    }

    #[test]
    fn raw_toml_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "nope = [");
        let err = read_raw_toml(&path).unwrap_err();
        assert!(err.to_string().contains("Malformed TOML"));
    }
}
