use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterviewConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Interviewer identity
    #[serde(default = "default_agent_template")]
    pub agent_template: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    // End-of-conversation detection
    #[serde(default = "default_closing_phrases")]
    pub closing_phrases: Vec<String>,

    // Timing knobs. The grace and settle delays are pacing choices; the
    // finalizer re-reads progress explicitly, so none of these are
    // correctness-critical.
    #[serde(default = "default_opening_line_delay_ms")]
    pub opening_line_delay_ms: u64,
    #[serde(default = "default_finalize_grace_ms")]
    pub finalize_grace_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    // Usage accounting
    #[serde(default = "default_usage_completion_threshold")]
    pub usage_completion_threshold: u8,

    // Prompt cache
    #[serde(default = "default_prompt_cache_capacity")]
    pub prompt_cache_capacity: usize,
    #[serde(default = "default_prompt_cache_ttl_secs")]
    pub prompt_cache_ttl_secs: u64,

    // Persistence
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_agent_template() -> String {
    "general".to_string()
}

fn default_system_prompt() -> String {
    "You are a professional interviewer conducting a structured screening \
     conversation. Work through the interview objectives one at a time. \
     Every reply must be a JSON object with a \"response\" field containing \
     what you say to the candidate and a \"currentObjectives\" field mapping \
     each objective key to its status (tbc, current, or done), count, \
     target, and guidance."
        .to_string()
}

fn default_closing_phrases() -> Vec<String> {
    vec![
        "thank you for your time".to_string(),
        "this concludes our interview".to_string(),
        "we'll be in touch".to_string(),
        "have a great rest of your day".to_string(),
        "it was a pleasure speaking with you".to_string(),
    ]
}

fn default_opening_line_delay_ms() -> u64 {
    1000
}

fn default_finalize_grace_ms() -> u64 {
    1500
}

fn default_settle_delay_ms() -> u64 {
    750
}

fn default_usage_completion_threshold() -> u8 {
    50
}

fn default_prompt_cache_capacity() -> usize {
    64
}

fn default_prompt_cache_ttl_secs() -> u64 {
    900
}

fn default_database_path() -> String {
    "parley_interviews.db".to_string()
}

impl Default for InterviewConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            agent_template: default_agent_template(),
            system_prompt: default_system_prompt(),
            closing_phrases: default_closing_phrases(),
            opening_line_delay_ms: default_opening_line_delay_ms(),
            finalize_grace_ms: default_finalize_grace_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            usage_completion_threshold: default_usage_completion_threshold(),
            prompt_cache_capacity: default_prompt_cache_capacity(),
            prompt_cache_ttl_secs: default_prompt_cache_ttl_secs(),
            database_path: default_database_path(),
        }
    }
}

impl InterviewConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("parley_config.toml")
    }

    /// Load config from parley_config.toml (next to executable), falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<InterviewConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(template) = env::var("PARLEY_AGENT_TEMPLATE") {
            if !template.trim().is_empty() {
                config.agent_template = template;
            }
        }

        if let Ok(path) = env::var("PARLEY_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(threshold) = env::var("PARLEY_USAGE_THRESHOLD") {
            if let Ok(pct) = threshold.parse() {
                config.usage_completion_threshold = pct;
            }
        }

        if let Ok(delay) = env::var("PARLEY_FINALIZE_GRACE_MS") {
            if let Ok(ms) = delay.parse() {
                config.finalize_grace_ms = ms;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = InterviewConfig::default();
        assert!(config.llm_api_url.starts_with("http"));
        assert!(!config.closing_phrases.is_empty());
        assert!(config.usage_completion_threshold <= 100);
        assert!(config.prompt_cache_capacity > 0);
    }

    #[test]
    fn parses_partial_toml() {
        let toml_src = r#"
            llm_model = "qwen2.5"
            usage_completion_threshold = 75
        "#;
        let config: InterviewConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.llm_model, "qwen2.5");
        assert_eq!(config.usage_completion_threshold, 75);
        assert_eq!(config.opening_line_delay_ms, 1000);
    }
}
