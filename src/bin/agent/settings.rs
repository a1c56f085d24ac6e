use std::fs;
use std::path::{Path, PathBuf};

use ankirag::auth::TokenPair;
use ankirag::config::get_config_dir_path;
use serde::{Deserialize, Serialize};

const SETTINGS_FILE: &str = "agent.toml";
const TOKEN_FILE: &str = "agent-token.json";

/// Local settings of the sync agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub anki_connect_url: String,
    pub api_base_url: String,
    /// Anki deck that receives pushed cards
    pub default_deck: String,
    /// Anki note type used for non-cloze cards
    pub default_model: String,
    /// Notes per import request
    pub import_batch_size: usize,
    /// Cards per page when fetching approved cards
    pub api_batch_size: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            anki_connect_url: "http://localhost:8765".to_string(),
            api_base_url: "http://localhost:8080".to_string(),
            default_deck: "AnkiRAG".to_string(),
            default_model: "Basic".to_string(),
            import_batch_size: 100,
            api_batch_size: 50,
        }
    }
}

impl AgentSettings {
    /// Reads settings from `dir`, falling back to defaults when the file is missing
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        toml::from_str(&content).map_err(|e| anyhow::anyhow!("invalid settings in {}: {e}", path.display()))
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(SETTINGS_FILE), toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Sets one setting from its textual form
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "anki_connect_url" => self.anki_connect_url = value.to_string(),
            "api_base_url" => self.api_base_url = value.trim_end_matches('/').to_string(),
            "default_deck" => self.default_deck = value.to_string(),
            "default_model" => self.default_model = value.to_string(),
            "import_batch_size" => self.import_batch_size = parse_batch_size(key, value)?,
            "api_batch_size" => self.api_batch_size = parse_batch_size(key, value)?,
            _ => anyhow::bail!("unknown setting '{key}'"),
        }
        Ok(())
    }
}

fn parse_batch_size(key: &str, value: &str) -> anyhow::Result<usize> {
    match value.parse::<usize>() {
        Ok(size) if (1..=100).contains(&size) => Ok(size),
        _ => anyhow::bail!("{key} must be a number between 1 and 100"),
    }
}

/// Directory holding the agent's settings and token
///
/// `ANKIRAG_AGENT_HOME` overrides the platform config directory.
pub fn agent_dir() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = std::env::var("ANKIRAG_AGENT_HOME") {
        return Ok(PathBuf::from(dir));
    }
    get_config_dir_path().ok_or_else(|| anyhow::anyhow!("could not determine a config directory"))
}

pub fn load_tokens(dir: &Path) -> anyhow::Result<Option<TokenPair>> {
    let path = dir.join(TOKEN_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

pub fn save_tokens(dir: &Path, tokens: &TokenPair) -> anyhow::Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(TOKEN_FILE), serde_json::to_string(tokens)?)?;
    Ok(())
}

/// Removes the stored token; returns whether one existed
pub fn clear_tokens(dir: &Path) -> anyhow::Result<bool> {
    let path = dir.join(TOKEN_FILE);
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let settings = AgentSettings::load(dir.path()).unwrap();
        assert_eq!(settings, AgentSettings::default());
        assert_eq!(settings.default_deck, "AnkiRAG");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let mut settings = AgentSettings::default();
        settings.set("default_deck", "Biology").unwrap();
        settings.set("api_base_url", "http://example.test:9000/").unwrap();
        settings.save(dir.path()).unwrap();

        let loaded = AgentSettings::load(dir.path()).unwrap();
        assert_eq!(loaded.default_deck, "Biology");
        assert_eq!(loaded.api_base_url, "http://example.test:9000");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(SETTINGS_FILE), "default_model = \"Basic (and reversed card)\"\n").unwrap();

        let loaded = AgentSettings::load(dir.path()).unwrap();
        assert_eq!(loaded.default_model, "Basic (and reversed card)");
        assert_eq!(loaded.api_batch_size, 50);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut settings = AgentSettings::default();
        assert!(settings.set("api_batch_size", "0").is_err());
        assert!(settings.set("api_batch_size", "many").is_err());
        assert!(settings.set("colour", "blue").is_err());
        assert_eq!(settings.api_batch_size, 50);
    }

    #[test]
    fn test_token_lifecycle() {
        let dir = tempdir().unwrap();
        assert!(load_tokens(dir.path()).unwrap().is_none());

        let tokens = TokenPair {
            access_token: "a".into(),
            refresh_token: "r".into(),
            token_type: "bearer".into(),
            expires_in: 1800,
        };
        save_tokens(dir.path(), &tokens).unwrap();
        assert_eq!(load_tokens(dir.path()).unwrap().unwrap().access_token, "a");

        assert!(clear_tokens(dir.path()).unwrap());
        assert!(!clear_tokens(dir.path()).unwrap());
    }
}
