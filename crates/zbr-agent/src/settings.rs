//! Agent settings layered from `agent.yaml` and environment variables.
//!
//! Every setting has a path such as `server.access_token`. The YAML file spells
//! it `server: { access-token: ... }`, optionally nested under `reporting:`.
//! The environment spells it `SERVER_ACCESS_TOKEN`, optionally prefixed with
//! `REPORTING_`. Prefixed forms win over bare ones and the environment wins over
//! the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

const PREFIX: &str = "reporting";
const SETTINGS_FILE_NAMES: [&str; 2] = ["agent.yaml", "agent.yml"];

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed settings file '{}': {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value '{value}' for boolean setting {name}")]
    InvalidBool { name: String, value: String },
    #[error("invalid agent settings: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSettings {
    pub hostname: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RunSettings {
    pub display_name: Option<String>,
    pub build: Option<String>,
    pub environment: Option<String>,
    /// Opaque rerun token exchanged with the backend before the run starts.
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NotificationSettings {
    pub slack_channels: Option<String>,
    pub ms_teams_channels: Option<String>,
    pub emails: Option<String>,
    #[serde(default)]
    pub notify_on_each_failure: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MilestoneSettings {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// Overrides supplied by the launcher for browser-driver sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LauncherSettings {
    /// JSON object merged into a driver's desired capabilities.
    pub capabilities: Option<String>,
    pub hub_url: Option<String>,
}

impl LauncherSettings {
    pub fn desired_capabilities(&self) -> Option<Map<String, Value>> {
        let raw = self.capabilities.as_deref()?;
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Some(map),
            Ok(_) | Err(_) => {
                warn!("ignoring launcher capabilities that are not a json object");
                None
            }
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_project_key() -> String {
    "DEF".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_project_key")]
    pub project_key: String,
    #[serde(default = "default_enabled")]
    pub send_logs: bool,
    pub server: ServerSettings,
    #[serde(default)]
    pub run: RunSettings,
    pub notification: Option<NotificationSettings>,
    pub milestone: Option<MilestoneSettings>,
    pub zebrunner: Option<LauncherSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettingKind {
    Text,
    Flag,
}

const SETTING_PATHS: &[(&[&str], SettingKind)] = &[
    (&["enabled"], SettingKind::Flag),
    (&["project_key"], SettingKind::Text),
    (&["send_logs"], SettingKind::Flag),
    (&["server", "hostname"], SettingKind::Text),
    (&["server", "access_token"], SettingKind::Text),
    (&["run", "display_name"], SettingKind::Text),
    (&["run", "build"], SettingKind::Text),
    (&["run", "environment"], SettingKind::Text),
    (&["run", "context"], SettingKind::Text),
    (&["notification", "slack_channels"], SettingKind::Text),
    (&["notification", "ms_teams_channels"], SettingKind::Text),
    (&["notification", "emails"], SettingKind::Text),
    (&["notification", "notify_on_each_failure"], SettingKind::Flag),
    (&["milestone", "id"], SettingKind::Text),
    (&["milestone", "name"], SettingKind::Text),
    (&["zebrunner", "capabilities"], SettingKind::Text),
    (&["zebrunner", "hub_url"], SettingKind::Text),
];

/// Loads settings from `agent.yaml` in the working directory and the process
/// environment.
pub fn load_settings() -> Result<Settings, SettingsError> {
    let env = std::env::vars().collect::<BTreeMap<_, _>>();
    load_settings_from(Path::new("."), &env)
}

/// Loads settings from `dir` and an explicit environment snapshot.
pub fn load_settings_from(
    dir: &Path,
    env: &BTreeMap<String, String>,
) -> Result<Settings, SettingsError> {
    let mut tree = Value::Object(Map::new());
    if let Some(yaml) = read_yaml(dir)? {
        for (path, kind) in SETTING_PATHS {
            if let Some(value) = yaml_setting(&yaml, path) {
                put_by_path(&mut tree, path, coerce(path, value, *kind)?);
            }
        }
    }
    for (path, kind) in SETTING_PATHS {
        if let Some(raw) = env_setting(env, path) {
            let value = coerce(path, Value::String(raw), *kind)?;
            put_by_path(&mut tree, path, value);
        }
    }
    Ok(serde_json::from_value(tree)?)
}

fn read_yaml(dir: &Path) -> Result<Option<Value>, SettingsError> {
    let Some(path) = SETTINGS_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
    else {
        return Ok(None);
    };
    let raw = std::fs::read_to_string(&path).map_err(|source| SettingsError::Read {
        path: path.clone(),
        source,
    })?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let value = serde_yaml::from_str::<Value>(&raw)
        .map_err(|source| SettingsError::Yaml { path, source })?;
    Ok(Some(value))
}

fn yaml_setting(yaml: &Value, path: &[&str]) -> Option<Value> {
    let dashed = path
        .iter()
        .map(|segment| segment.replace('_', "-"))
        .collect::<Vec<_>>();
    let mut prefixed = vec![PREFIX.to_string()];
    prefixed.extend(dashed.iter().cloned());
    get_by_path(yaml, &prefixed)
        .or_else(|| get_by_path(yaml, &dashed))
        .filter(|value| !value.is_null())
        .cloned()
}

fn env_setting(env: &BTreeMap<String, String>, path: &[&str]) -> Option<String> {
    let bare = path.join("_").to_ascii_uppercase();
    let prefixed = format!("{}_{bare}", PREFIX.to_ascii_uppercase());
    env.get(&prefixed).or_else(|| env.get(&bare)).cloned()
}

fn get_by_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |current, segment| current.get(segment.as_str()))
}

fn put_by_path(tree: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = tree;
    for segment in parents {
        if !current.get(*segment).is_some_and(Value::is_object) {
            current[*segment] = Value::Object(Map::new());
        }
        current = &mut current[*segment];
    }
    current[*last] = value;
}

fn coerce(path: &[&str], value: Value, kind: SettingKind) -> Result<Value, SettingsError> {
    match (kind, value) {
        (SettingKind::Flag, Value::Bool(flag)) => Ok(Value::Bool(flag)),
        (SettingKind::Flag, Value::String(raw)) => parse_flag(&raw)
            .map(Value::Bool)
            .ok_or_else(|| SettingsError::InvalidBool {
                name: path.join("."),
                value: raw,
            }),
        (SettingKind::Flag, other) => Err(SettingsError::InvalidBool {
            name: path.join("."),
            value: other.to_string(),
        }),
        (SettingKind::Text, Value::String(raw)) => Ok(Value::String(raw)),
        (SettingKind::Text, Value::Number(number)) => Ok(Value::String(number.to_string())),
        (SettingKind::Text, Value::Bool(flag)) => Ok(Value::String(flag.to_string())),
        (SettingKind::Text, other) => Ok(Value::String(other.to_string())),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
