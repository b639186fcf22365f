//! Configuration file loading and parsing.

use crate::types::TachikomaConfig;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory holding project configuration.
pub const CONFIG_DIR: &str = ".tachikoma";
/// Config file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "config.yaml";

/// Config loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {source}")]
    ReadError {
        #[from]
        source: std::io::Error,
    },

    #[error("invalid YAML at line {}: {message}", line.map(|l| l.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    ParseError { line: Option<usize>, message: String },

    #[error("validation error: {message}")]
    ValidationError { message: String },

    #[error("environment variable not found: {var}")]
    EnvVarNotFound { var: String },
}

/// Configuration loader.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Create a loader for `<project_dir>/.tachikoma/config.yaml`.
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        Self {
            config_path: project_dir.as_ref().join(CONFIG_DIR).join(CONFIG_FILE),
        }
    }

    /// Create a loader for an explicit config file.
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration; a missing file yields the defaults.
    pub fn load(&self) -> Result<TachikomaConfig, ConfigError> {
        if !self.config_path.exists() {
            return Ok(TachikomaConfig::default());
        }

        let contents = std::fs::read_to_string(&self.config_path)?;
        let expanded = expand_env_vars(&contents)?;

        let config: TachikomaConfig =
            serde_yaml::from_str(&expanded).map_err(|e| ConfigError::ParseError {
                line: e.location().map(|l| l.line()),
                message: e.to_string(),
            })?;

        validate(&config)?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self, config: &TachikomaConfig) -> Result<(), ConfigError> {
        validate(config)?;
        if let Some(dir) = self.config_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let yaml = serde_yaml::to_string(config).map_err(|e| ConfigError::ParseError {
            line: None,
            message: e.to_string(),
        })?;

        std::fs::write(&self.config_path, yaml)?;
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new(std::env::current_dir().unwrap_or_default())
    }
}

/// Expand environment variables in the form `${VAR}` or `${VAR:-default}`.
pub fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").map_err(|e| {
        ConfigError::ParseError {
            line: None,
            message: e.to_string(),
        }
    })?;

    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        let full_match = &cap[0];
        let var_name = &cap[1];
        let default = cap.get(2).map(|m| m.as_str());

        let value = match std::env::var(var_name) {
            Ok(v) => v,
            Err(_) => match default {
                Some(d) => d.to_string(),
                None => {
                    return Err(ConfigError::EnvVarNotFound {
                        var: var_name.to_string(),
                    })
                }
            },
        };

        result = result.replace(full_match, &value);
    }

    Ok(result)
}

/// Validate configuration values.
pub fn validate(config: &TachikomaConfig) -> Result<(), ConfigError> {
    let invalid = |message: String| Err(ConfigError::ValidationError { message });

    let mut seen = HashSet::new();
    for name in &config.plugins.enabled {
        if name.trim().is_empty() {
            return invalid("plugins.enabled contains an empty name".to_string());
        }
        if name.contains(['/', '\\']) || name == "." || name == ".." {
            return invalid(format!("plugins.enabled: {name:?} is not a plain plugin name"));
        }
        if !seen.insert(name.as_str()) {
            return invalid(format!("plugins.enabled lists {name:?} more than once"));
        }
    }

    for (field, dir) in [
        ("plugins.global_dir", &config.plugins.global_dir),
        ("plugins.project_dir", &config.plugins.project_dir),
    ] {
        if dir.as_ref().is_some_and(|d| d.as_os_str().is_empty()) {
            return invalid(format!("{field} must not be empty"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn write_config(dir: &Path, content: &str) {
        let config_dir = dir.join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join(CONFIG_FILE), content).unwrap();
    }

    #[test]
    fn test_load_defaults_when_no_file() {
        let dir = tempdir().unwrap();
        let config = ConfigLoader::new(dir.path()).load().unwrap();
        assert!(config.plugins.enabled.is_empty());
        assert!(config.plugins.config.is_empty());
    }

    #[test]
    fn test_load_plugin_settings() {
        let dir = tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
plugins:
  enabled: [jira, coder]
  global_dir: /opt/tachikoma/plugins
  config:
    jira:
      url: https://jira.example.com
      projects: [CORE, WEB]
      timeout: 30
"#,
        );

        let config = ConfigLoader::new(dir.path()).load().unwrap();

        assert!(config.plugins.is_enabled("coder"));
        assert!(!config.plugins.is_enabled("linear"));
        assert_eq!(
            config.plugins.global_dir.as_deref(),
            Some(Path::new("/opt/tachikoma/plugins"))
        );
        let jira = config.plugins.config_for("jira");
        assert_eq!(jira["url"], "https://jira.example.com");
        assert_eq!(jira["projects"], json!(["CORE", "WEB"]));
        assert_eq!(jira["timeout"], 30);
        assert!(config.plugins.config_for("coder").is_empty());
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TACHIKOMA_TEST_JIRA_TOKEN", "s3cret");
        let result = expand_env_vars("token: ${TACHIKOMA_TEST_JIRA_TOKEN}").unwrap();
        assert_eq!(result, "token: s3cret");
        std::env::remove_var("TACHIKOMA_TEST_JIRA_TOKEN");
    }

    #[test]
    fn test_env_var_default() {
        let result = expand_env_vars("url: ${TACHIKOMA_TEST_NONEXISTENT:-http://localhost}").unwrap();
        assert_eq!(result, "url: http://localhost");
    }

    #[test]
    fn test_env_var_missing_error() {
        match expand_env_vars("key: ${TACHIKOMA_TEST_MISSING_VAR}").unwrap_err() {
            ConfigError::EnvVarNotFound { var } => assert_eq!(var, "TACHIKOMA_TEST_MISSING_VAR"),
            other => panic!("Expected EnvVarNotFound error, got {other}"),
        }
    }

    #[test]
    fn test_env_var_expansion_in_config() {
        std::env::set_var("TACHIKOMA_TEST_AGENT", "coder");
        let dir = tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
plugins:
  enabled: ["${TACHIKOMA_TEST_AGENT}"]
  config:
    coder:
      model: ${TACHIKOMA_TEST_MODEL:-sonnet}
"#,
        );

        let config = ConfigLoader::new(dir.path()).load().unwrap();

        assert_eq!(config.plugins.enabled, vec!["coder".to_string()]);
        assert_eq!(config.plugins.config_for("coder")["model"], "sonnet");
        std::env::remove_var("TACHIKOMA_TEST_AGENT");
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            (vec!["jira", "jira"], "more than once"),
            (vec![""], "empty name"),
            (vec!["../evil"], "not a plain plugin name"),
        ];

        for (enabled, expected) in cases {
            let mut config = TachikomaConfig::default();
            config.plugins.enabled = enabled.into_iter().map(String::from).collect();
            match validate(&config).unwrap_err() {
                ConfigError::ValidationError { message } => {
                    assert!(message.contains(expected), "{message}")
                }
                other => panic!("Expected ValidationError, got {other}"),
            }
        }

        let mut config = TachikomaConfig::default();
        config.plugins.project_dir = Some(PathBuf::new());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_parse_error_with_line_number() {
        let dir = tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
plugins:
  enabled: [unclosed
"#,
        );

        match ConfigLoader::new(dir.path()).load().unwrap_err() {
            ConfigError::ParseError { line, .. } => assert!(line.is_some()),
            other => panic!("Expected ParseError with line number, got {other}"),
        }
    }

    #[test]
    fn test_save_config() {
        let dir = tempdir().unwrap();
        let loader = ConfigLoader::new(dir.path());

        let mut config = TachikomaConfig::default();
        config.plugins.enabled.push("jira".to_string());
        let mut jira = serde_json::Map::new();
        jira.insert("url".to_string(), json!("https://jira.example.com"));
        config.plugins.config.insert("jira".to_string(), jira);

        loader.save(&config).unwrap();

        assert!(dir.path().join(".tachikoma/config.yaml").exists());
        assert_eq!(loader.load().unwrap(), config);
    }

    #[test]
    fn test_explicit_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.yaml");
        fs::write(&path, "plugins:\n  enabled: [coder]\n").unwrap();

        let loader = ConfigLoader::with_path(&path);

        assert_eq!(loader.config_path(), path);
        assert!(loader.load().unwrap().plugins.is_enabled("coder"));
    }
}
