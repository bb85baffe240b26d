//! Explicit run configuration, built once from the CLI and threaded through
//! every stage.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::cli::{AnkiArgs, ApiKey, GenerateArgs, GenerationArgs, LlmEngine, StoreArgs, UploadArgs};

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub engine: LlmEngine,
    pub model: String,
    pub api_key: Option<ApiKey>,
    pub openai_base_url: String,
    pub temperature: f32,
    pub request_timeout: Duration,
    pub max_tokens: usize,
    pub concurrency: usize,
    pub retries: usize,
    pub backoff: Duration,
    pub command: Option<String>,
    pub command_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub anki_url: Url,
    pub note_type: String,
    pub extra_tags: Vec<String>,
    pub concurrency: usize,
    pub retries: usize,
    pub backoff: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub inputs: Vec<PathBuf>,
    pub deck: Option<String>,
    pub max_regenerations: usize,
    pub skip_upload: bool,
    pub generation: GenerationConfig,
    pub store_path: PathBuf,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub deck: Option<String>,
    pub store_path: PathBuf,
    pub sync: SyncConfig,
}

impl GenerationConfig {
    pub fn from_args(args: &GenerationArgs) -> anyhow::Result<Self> {
        if args.model.trim().is_empty() {
            anyhow::bail!("model identifier is empty (set --model or CARDSMITH_MODEL)");
        }
        if args.max_tokens == 0 {
            anyhow::bail!("--max-tokens must be > 0");
        }

        let api_key = args
            .api_key
            .clone()
            .filter(|key| !key.expose().trim().is_empty());
        match args.engine {
            LlmEngine::Openai if api_key.is_none() => {
                anyhow::bail!("OPENAI_API_KEY is not set")
            }
            LlmEngine::Command if args.command.is_none() => {
                anyhow::bail!("missing --command (required when --engine=command)")
            }
            _ => {}
        }

        Ok(Self {
            engine: args.engine,
            model: args.model.trim().to_owned(),
            api_key,
            openai_base_url: args.openai_base_url.clone(),
            temperature: args.openai_temperature,
            request_timeout: Duration::from_secs(args.request_timeout_secs.max(1)),
            max_tokens: args.max_tokens,
            concurrency: args.concurrency.max(1),
            retries: args.retries,
            backoff: Duration::from_millis(args.backoff_ms),
            command: args.command.clone(),
            command_args: args.command_args.clone(),
        })
    }
}

impl SyncConfig {
    pub fn from_args(args: &AnkiArgs) -> anyhow::Result<Self> {
        let anki_url = Url::parse(&args.anki_url)
            .map_err(|err| anyhow::anyhow!("invalid --anki-url {}: {err}", args.anki_url))?;
        if !matches!(anki_url.scheme(), "http" | "https") {
            anyhow::bail!("--anki-url must be http/https: {anki_url}");
        }
        if args.note_type.trim().is_empty() {
            anyhow::bail!("--note-type is empty");
        }

        Ok(Self {
            anki_url,
            note_type: args.note_type.trim().to_owned(),
            extra_tags: args
                .tags
                .iter()
                .map(|tag| tag.trim().to_owned())
                .filter(|tag| !tag.is_empty())
                .collect(),
            concurrency: args.upload_concurrency.max(1),
            retries: args.upload_retries,
            backoff: Duration::from_millis(250),
            request_timeout: Duration::from_secs(args.upload_timeout_secs.max(1)),
        })
    }
}

impl SessionConfig {
    pub fn from_args(args: &GenerateArgs) -> anyhow::Result<Self> {
        Ok(Self {
            inputs: args.inputs.iter().map(PathBuf::from).collect(),
            deck: normalize_deck(args.deck.as_deref()),
            max_regenerations: args.max_regenerations,
            skip_upload: args.skip_upload,
            generation: GenerationConfig::from_args(&args.generation)?,
            store_path: store_path(&args.store),
            sync: SyncConfig::from_args(&args.anki)?,
        })
    }
}

impl UploadConfig {
    pub fn from_args(args: &UploadArgs) -> anyhow::Result<Self> {
        Ok(Self {
            deck: normalize_deck(args.deck.as_deref()),
            store_path: store_path(&args.store),
            sync: SyncConfig::from_args(&args.anki)?,
        })
    }
}

fn store_path(args: &StoreArgs) -> PathBuf {
    PathBuf::from(&args.store)
}

fn normalize_deck(deck: Option<&str>) -> Option<String> {
    deck.map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;

    use super::*;
    use crate::cli::{Cli, Command};

    fn parse_generate(args: &[&str]) -> GenerateArgs {
        let cli = Cli::try_parse_from(args.iter().copied()).expect("parse cli");
        match cli.command {
            Command::Generate(args) => args,
            Command::Upload(_) => panic!("expected generate"),
        }
    }

    #[test]
    fn openai_engine_requires_api_key() {
        let mut args = parse_generate(&["cardsmith", "generate", "notes", "--model", "gpt-4o-mini"]);
        // Independent of any OPENAI_API_KEY in the test environment.
        args.generation.api_key = None;
        let err = GenerationConfig::from_args(&args.generation).expect_err("missing key must fail");
        assert!(err.to_string().contains("OPENAI_API_KEY"));

        args.generation.api_key = "   ".parse().ok();
        let err = GenerationConfig::from_args(&args.generation).expect_err("blank key must fail");
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn heuristic_engine_builds_config_without_key() -> anyhow::Result<()> {
        let args = parse_generate(&[
            "cardsmith",
            "generate",
            "notes",
            "more.md",
            "--engine",
            "heuristic",
            "--model",
            "local",
            "--deck",
            "  Geo ",
            "--tags",
            "geo, europe,,",
            "--concurrency",
            "0",
        ]);
        let config = SessionConfig::from_args(&args)?;

        assert_eq!(config.inputs.len(), 2);
        assert_eq!(config.deck.as_deref(), Some("Geo"));
        assert_eq!(config.generation.concurrency, 1);
        assert_eq!(config.sync.extra_tags, vec!["geo", "europe"]);
        Ok(())
    }

    #[test]
    fn command_engine_requires_command() {
        let args = parse_generate(&[
            "cardsmith",
            "generate",
            "notes",
            "--engine",
            "command",
            "--model",
            "m",
        ]);
        assert!(GenerationConfig::from_args(&args.generation).is_err());
    }
}
