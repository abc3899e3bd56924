//! TOML configuration.
//!
//! Every command loads a [`Config`] from `--config` (default
//! `./config/pkb.toml`). Sections other than `[db]`, `[storage]` and
//! `[server]` are optional and fall back to the defaults below.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::IndexDepth;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub import: ImportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding uploaded file bytes.
    pub root: PathBuf,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_max_file_bytes() -> u64 {
    200 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default)]
    pub default_depth: IndexDepth,
    /// Queue a summary whenever a file ends up with text.
    #[serde(default)]
    pub auto_summarize: bool,
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            default_depth: IndexDepth::default(),
            auto_summarize: false,
            max_content_chars: default_max_content_chars(),
        }
    }
}

fn default_max_content_chars() -> usize {
    2_000_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_summary_max_words")]
    pub summary_max_words: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            base_url: default_base_url(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_context_chars: default_max_context_chars(),
            summary_max_words: default_summary_max_words(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_context_chars() -> usize {
    12_000
}
fn default_summary_max_words() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_disabled")]
    pub engine: String,
    #[serde(default = "default_tesseract")]
    pub command: String,
    #[serde(default = "default_languages")]
    pub languages: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            engine: default_disabled(),
            command: default_tesseract(),
            languages: default_languages(),
        }
    }
}

fn default_tesseract() -> String {
    "tesseract".to_string()
}
fn default_languages() -> String {
    "eng".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranscriptionConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_whisper")]
    pub model: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: default_whisper(),
        }
    }
}

fn default_whisper() -> String {
    "whisper-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

impl Config {
    /// A config rooted at `root` with every external service disabled.
    pub fn minimal(root: &Path) -> Self {
        Self {
            db: DbConfig {
                path: root.join("data").join("pkb.sqlite"),
            },
            storage: StorageConfig {
                root: root.join("files"),
                max_file_bytes: default_max_file_bytes(),
            },
            index: IndexConfig::default(),
            llm: LlmConfig::default(),
            ocr: OcrConfig::default(),
            transcription: TranscriptionConfig::default(),
            server: ServerConfig {
                bind: "127.0.0.1:7341".to_string(),
            },
            import: ImportConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.storage.max_file_bytes == 0 {
        bail!("storage.max_file_bytes must be > 0");
    }
    if config.index.max_content_chars == 0 {
        bail!("index.max_content_chars must be > 0");
    }
    if config.llm.max_context_chars == 0 {
        bail!("llm.max_context_chars must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.llm.model.is_none() {
                bail!("llm.model must be specified when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.ocr.engine.as_str() {
        "disabled" | "tesseract" => {}
        other => bail!(
            "Unknown ocr engine: '{}'. Must be disabled or tesseract.",
            other
        ),
    }

    match config.transcription.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown transcription provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let text = format!(
            r#"[db]
path = "/tmp/pkb.sqlite"

[storage]
root = "/tmp/files"

[server]
bind = "127.0.0.1:7341"
{}"#,
            extra
        );
        let config: Config = toml::from_str(&text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn defaults_apply_to_optional_sections() {
        let config = parse("").unwrap();
        assert_eq!(config.index.default_depth, IndexDepth::Standard);
        assert!(!config.llm.is_enabled());
        assert_eq!(config.ocr.engine, "disabled");
        assert_eq!(config.transcription.model, "whisper-1");
        assert_eq!(config.import.include_globs, vec!["**/*".to_string()]);
    }

    #[test]
    fn openai_requires_model() {
        let err = parse("[llm]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("llm.model"));
    }

    #[test]
    fn unknown_ocr_engine_rejected() {
        let err = parse("[ocr]\nengine = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown ocr engine"));
    }

    #[test]
    fn depth_parses_lowercase() {
        let config = parse("[index]\ndefault_depth = \"deep\"\n").unwrap();
        assert_eq!(config.index.default_depth, IndexDepth::Deep);
    }
}
