//! Configuration for taintbomb.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (TAINTBOMB_HOME, TAINTBOMB_SCRIPTS,
//!    TAINTBOMB_PYTHON, TAINTBOMB_API_KEY)
//! 2. Config file (.taintbomb/config.yaml)
//! 3. Defaults (~/.taintbomb, python3)
//!
//! Config file discovery:
//! - Searches the starting directory and its parents for .taintbomb/config.yaml
//! - `paths.home` is relative to the .taintbomb/ directory, `paths.scripts`
//!   to the project root (the directory containing .taintbomb/)
//!
//! The resolved configuration is a plain value handed to whoever needs it;
//! there is no process-wide settings singleton.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::drain::{DrainPolicy, DRAIN_GRACE_MS, DRAIN_INTERRUPT_WAIT_MS};
use crate::core::executor::TERMINATE_GRACE_MS;

/// Directory holding the config file
pub const CONFIG_DIR: &str = ".taintbomb";

/// Config file name inside `CONFIG_DIR`
pub const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_INTERPRETER: &str = "python3";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub features: FeatureSettings,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub process: Option<ProcessConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            interpreter: None,
            paths: PathsConfig::default(),
            features: FeatureSettings::default(),
            api_key: None,
            process: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// State directory for run journals (relative to .taintbomb/)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    /// Directory containing the stage scripts (relative to project root)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub drain_grace_ms: Option<u64>,
    pub drain_interrupt_wait_ms: Option<u64>,
    pub terminate_grace_ms: Option<u64>,
}

/// Optional obfuscation features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    RemoveComments,
    StringEncryption,
    IdentifierObfuscation,
    OperatorObfuscation,
    MethodSplitting,
    InsertDummyCode,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::RemoveComments,
        Feature::StringEncryption,
        Feature::IdentifierObfuscation,
        Feature::OperatorObfuscation,
        Feature::MethodSplitting,
        Feature::InsertDummyCode,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::RemoveComments => "remove_comments",
            Self::StringEncryption => "string_encryption",
            Self::IdentifierObfuscation => "identifier_obfuscation",
            Self::OperatorObfuscation => "operator_obfuscation",
            Self::MethodSplitting => "method_splitting",
            Self::InsertDummyCode => "insert_dummy_code",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Feature toggles (all enabled by default)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSettings {
    #[serde(default = "default_true")]
    pub remove_comments: bool,
    #[serde(default = "default_true")]
    pub string_encryption: bool,
    #[serde(default = "default_true")]
    pub identifier_obfuscation: bool,
    #[serde(default = "default_true")]
    pub operator_obfuscation: bool,
    #[serde(default = "default_true")]
    pub method_splitting: bool,
    #[serde(default = "default_true")]
    pub insert_dummy_code: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            remove_comments: true,
            string_encryption: true,
            identifier_obfuscation: true,
            operator_obfuscation: true,
            method_splitting: true,
            insert_dummy_code: true,
        }
    }
}

impl FeatureSettings {
    pub fn get(&self, feature: Feature) -> bool {
        match feature {
            Feature::RemoveComments => self.remove_comments,
            Feature::StringEncryption => self.string_encryption,
            Feature::IdentifierObfuscation => self.identifier_obfuscation,
            Feature::OperatorObfuscation => self.operator_obfuscation,
            Feature::MethodSplitting => self.method_splitting,
            Feature::InsertDummyCode => self.insert_dummy_code,
        }
    }

    pub fn set(&mut self, feature: Feature, enabled: bool) {
        let slot = match feature {
            Feature::RemoveComments => &mut self.remove_comments,
            Feature::StringEncryption => &mut self.string_encryption,
            Feature::IdentifierObfuscation => &mut self.identifier_obfuscation,
            Feature::OperatorObfuscation => &mut self.operator_obfuscation,
            Feature::MethodSplitting => &mut self.method_splitting,
            Feature::InsertDummyCode => &mut self.insert_dummy_code,
        };
        *slot = enabled;
    }
}

/// Per-run settings handed to the plan builder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObfuscationSettings {
    pub features: FeatureSettings,
    pub api_key: String,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to taintbomb home (run journals)
    pub home: PathBuf,
    /// Directory containing the stage scripts
    pub scripts_dir: PathBuf,
    /// Interpreter used to run the stage scripts
    pub interpreter: String,
    /// Feature toggles and API key
    pub settings: ObfuscationSettings,
    /// Drain shutdown bounds
    pub drain: DrainPolicy,
    /// Wait between terminate request and forced kill
    pub terminate_grace: Duration,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Directory holding one subdirectory per run
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Where settings changes are written
    pub fn settings_path(&self, cwd: &Path) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(|| cwd.join(CONFIG_DIR).join(CONFIG_FILE))
    }
}

/// Find config file by searching `start` and its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(&path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration for the current directory and process environment
pub fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    load_config_from(&cwd, &default_home, |key| std::env::var(key).ok())
}

/// Load configuration starting the file search at `start`.
///
/// `env` looks up environment overrides; tests pass a closure instead of
/// touching the process environment.
pub fn load_config_from<F>(start: &Path, default_home: &Path, env: F) -> Result<ResolvedConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let config_file = find_config_file(start);

    let (file, config_dir, project_root) = match config_file {
        Some(ref config_path) => {
            let file = load_config_file(config_path)?;
            let config_dir = config_path
                .parent()
                .unwrap_or(Path::new("."))
                .to_path_buf();
            let project_root = config_dir
                .parent()
                .unwrap_or(Path::new("."))
                .to_path_buf();
            (file, Some(config_dir), Some(project_root))
        }
        None => (ConfigFile::default(), None, None),
    };

    let home = match (env("TAINTBOMB_HOME"), &file.paths.home, &config_dir) {
        (Some(env_home), _, _) => PathBuf::from(env_home),
        (None, Some(home), Some(dir)) => resolve_path(dir, home),
        _ => default_home.to_path_buf(),
    };

    let scripts_dir = match (env("TAINTBOMB_SCRIPTS"), &file.paths.scripts, &project_root) {
        (Some(env_scripts), _, _) => PathBuf::from(env_scripts),
        (None, Some(scripts), Some(root)) => resolve_path(root, scripts),
        _ => home.join("pyscripts"),
    };

    let interpreter = env("TAINTBOMB_PYTHON")
        .or_else(|| file.interpreter.clone())
        .unwrap_or_else(|| DEFAULT_INTERPRETER.to_string());

    let api_key = env("TAINTBOMB_API_KEY")
        .or_else(|| file.api_key.clone())
        .unwrap_or_default();

    let process = file.process.as_ref();
    let drain = DrainPolicy {
        grace: Duration::from_millis(
            process
                .and_then(|p| p.drain_grace_ms)
                .unwrap_or(DRAIN_GRACE_MS),
        ),
        interrupt_wait: Duration::from_millis(
            process
                .and_then(|p| p.drain_interrupt_wait_ms)
                .unwrap_or(DRAIN_INTERRUPT_WAIT_MS),
        ),
    };
    let terminate_grace = Duration::from_millis(
        process
            .and_then(|p| p.terminate_grace_ms)
            .unwrap_or(TERMINATE_GRACE_MS),
    );

    Ok(ResolvedConfig {
        home,
        scripts_dir,
        interpreter,
        settings: ObfuscationSettings {
            features: file.features,
            api_key,
        },
        drain,
        terminate_grace,
        config_file,
    })
}

// ============================================================================
// Settings persistence
// ============================================================================

/// Read/write access to persisted feature flags and the API key
pub trait SettingsStore {
    fn settings(&self) -> ObfuscationSettings;

    fn flag(&self, feature: Feature) -> bool {
        self.settings().features.get(feature)
    }

    fn set_flag(&mut self, feature: Feature, enabled: bool);

    fn api_key(&self) -> String {
        self.settings().api_key
    }

    fn set_api_key(&mut self, key: String);

    /// Persist pending changes
    fn save(&self) -> Result<()>;
}

/// Settings stored in the YAML config file
#[derive(Debug, Clone)]
pub struct YamlSettingsStore {
    path: PathBuf,
    file: ConfigFile,
}

impl YamlSettingsStore {
    /// Open the store; a missing file starts from defaults
    pub fn open(path: &Path) -> Result<Self> {
        let file = if path.exists() {
            load_config_file(path)?
        } else {
            ConfigFile::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for YamlSettingsStore {
    fn settings(&self) -> ObfuscationSettings {
        ObfuscationSettings {
            features: self.file.features,
            api_key: self.file.api_key.clone().unwrap_or_default(),
        }
    }

    fn set_flag(&mut self, feature: Feature, enabled: bool) {
        self.file.features.set(feature, enabled);
    }

    fn set_api_key(&mut self, key: String) {
        self.file.api_key = if key.is_empty() { None } else { Some(key) };
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let yaml = serde_yaml::to_string(&self.file).context("Failed to serialize settings")?;
        std::fs::write(&self.path, yaml)
            .with_context(|| format!("Failed to write config file: {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(root: &Path, content: &str) -> PathBuf {
        let dir = root.join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", content).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home");

        let config = load_config_from(temp.path(), &home, no_env).unwrap();

        assert_eq!(config.home, home);
        assert_eq!(config.scripts_dir, home.join("pyscripts"));
        assert_eq!(config.interpreter, "python3");
        assert_eq!(config.settings.features, FeatureSettings::default());
        assert!(config.settings.api_key.is_empty());
        assert_eq!(config.drain, DrainPolicy::default());
        assert_eq!(config.terminate_grace, Duration::from_millis(500));
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            r#"
version: "1.0"
interpreter: /opt/venv/bin/python
paths:
  home: ./state
  scripts: ./pyscripts
features:
  remove_comments: false
  method_splitting: false
api_key: sk-test
process:
  drain_grace_ms: 100
  terminate_grace_ms: 50
"#,
        );
        std::fs::create_dir_all(temp.path().join("pyscripts")).unwrap();

        let nested = temp.path().join("src").join("main");
        std::fs::create_dir_all(&nested).unwrap();
        let config = load_config_from(&nested, Path::new("/unused"), no_env).unwrap();

        assert_eq!(config.config_file, Some(path));
        assert_eq!(config.interpreter, "/opt/venv/bin/python");
        assert!(config.home.ends_with("state"));
        assert_eq!(
            config.scripts_dir,
            temp.path().join("pyscripts").canonicalize().unwrap()
        );
        assert!(!config.settings.features.remove_comments);
        assert!(!config.settings.features.method_splitting);
        assert!(config.settings.features.string_encryption);
        assert_eq!(config.settings.api_key, "sk-test");
        assert_eq!(config.drain.grace, Duration::from_millis(100));
        assert_eq!(config.drain.interrupt_wait, Duration::from_millis(1000));
        assert_eq!(config.terminate_grace, Duration::from_millis(50));
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "version: \"1.0\"\ninterpreter: python3.11\napi_key: from-file\n");

        let env: HashMap<&str, &str> = [
            ("TAINTBOMB_PYTHON", "/usr/bin/python3"),
            ("TAINTBOMB_API_KEY", "from-env"),
            ("TAINTBOMB_HOME", "/var/lib/taintbomb"),
        ]
        .into_iter()
        .collect();

        let config = load_config_from(temp.path(), Path::new("/unused"), |key| {
            env.get(key).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.interpreter, "/usr/bin/python3");
        assert_eq!(config.settings.api_key, "from-env");
        assert_eq!(config.home, PathBuf::from("/var/lib/taintbomb"));
        assert_eq!(config.runs_dir(), PathBuf::from("/var/lib/taintbomb/runs"));
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "features: [not, a, map]");

        assert!(load_config_from(temp.path(), Path::new("/unused"), no_env).is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/./subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }

    #[test]
    fn test_feature_settings_roundtrip_by_key() {
        let mut features = FeatureSettings::default();
        for feature in Feature::ALL {
            assert!(features.get(feature));
            features.set(feature, false);
            assert!(!features.get(feature), "{} should be disabled", feature);
        }
    }

    #[test]
    fn test_settings_store_persists_changes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_DIR).join(CONFIG_FILE);

        let mut store = YamlSettingsStore::open(&path).unwrap();
        assert!(store.flag(Feature::StringEncryption));

        store.set_flag(Feature::StringEncryption, false);
        store.set_api_key("sk-live".to_string());
        store.save().unwrap();

        let reopened = YamlSettingsStore::open(&path).unwrap();
        assert!(!reopened.flag(Feature::StringEncryption));
        assert!(reopened.flag(Feature::RemoveComments));
        assert_eq!(reopened.api_key(), "sk-live");
    }

    #[test]
    fn test_settings_store_keeps_other_fields() {
        let temp = TempDir::new().unwrap();
        let path = write_config(temp.path(), "version: \"1.0\"\ninterpreter: pypy3\n");

        let mut store = YamlSettingsStore::open(&path).unwrap();
        store.set_flag(Feature::InsertDummyCode, false);
        store.save().unwrap();

        let file = load_config_file(&path).unwrap();
        assert_eq!(file.interpreter.as_deref(), Some("pypy3"));
        assert!(!file.features.insert_dummy_code);
    }
}
