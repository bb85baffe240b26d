use std::fmt;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Log at debug level (overridden by RUST_LOG).
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate flashcards from notes, review them, save and upload.
    Generate(GenerateArgs),
    /// Upload the previously saved flashcards without regenerating.
    Upload(UploadArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LlmEngine {
    Openai,
    Command,
    Heuristic,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Note files or directories (walked recursively).
    #[arg(required = true)]
    pub inputs: Vec<String>,

    /// Target deck name (prompted for when omitted).
    #[arg(long)]
    pub deck: Option<String>,

    /// Maximum number of regenerations before the session is abandoned.
    #[arg(long, default_value_t = 3)]
    pub max_regenerations: usize,

    /// Save the accepted flashcards without uploading them.
    #[arg(long)]
    pub skip_upload: bool,

    #[command(flatten)]
    pub generation: GenerationArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub anki: AnkiArgs,
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    /// Target deck name (prompted for when omitted).
    #[arg(long)]
    pub deck: Option<String>,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub anki: AnkiArgs,
}

#[derive(Debug, Args)]
pub struct GenerationArgs {
    /// Generation backend.
    #[arg(long, value_enum, default_value_t = LlmEngine::Openai)]
    pub engine: LlmEngine,

    /// Model identifier passed to the generation backend.
    #[arg(long, env = "CARDSMITH_MODEL")]
    pub model: String,

    /// API credential for the OpenAI engine.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<ApiKey>,

    /// OpenAI API base URL.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = crate::openai::DEFAULT_BASE_URL)]
    pub openai_base_url: String,

    /// Sampling temperature (ignored by models that reject it).
    #[arg(long, default_value_t = 0.2)]
    pub openai_temperature: f32,

    /// Per-request timeout for the generation backend.
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,

    /// Token budget per chunk of notes.
    #[arg(long, default_value_t = 1500)]
    pub max_tokens: usize,

    /// Maximum concurrent generation requests.
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Retries after a model timeout.
    #[arg(long, default_value_t = 2)]
    pub retries: usize,

    /// Base delay for exponential backoff between retries.
    #[arg(long, default_value_t = 500)]
    pub backoff_ms: u64,

    /// External generator program (required when --engine=command).
    #[arg(long)]
    pub command: Option<String>,

    /// Argument passed to the external generator (repeatable).
    #[arg(long = "command-arg", allow_hyphen_values = true)]
    pub command_args: Vec<String>,
}

#[derive(Debug, Args)]
pub struct StoreArgs {
    /// Flashcard store file (JSON array).
    #[arg(long, env = "CARDSMITH_STORE", default_value = "flashcards/flashcards.json")]
    pub store: String,
}

#[derive(Debug, Args)]
pub struct AnkiArgs {
    /// AnkiConnect endpoint.
    #[arg(long, env = "CARDSMITH_ANKI_URL", default_value = "http://127.0.0.1:8765")]
    pub anki_url: String,

    /// Anki note type; must have `Front` and `Back` fields.
    #[arg(long, env = "CARDSMITH_NOTE_TYPE", default_value = "Basic")]
    pub note_type: String,

    /// Extra tags added to every uploaded card (comma separated).
    #[arg(long, env = "CARDSMITH_TAGS", value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Maximum concurrent uploads.
    #[arg(long, default_value_t = 4)]
    pub upload_concurrency: usize,

    /// Retries for a card after a transient failure.
    #[arg(long, default_value_t = 2)]
    pub upload_retries: usize,

    /// Per-request timeout for AnkiConnect calls.
    #[arg(long, default_value_t = 10)]
    pub upload_timeout_secs: u64,
}

/// Credential that never shows up in debug output.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

impl FromStr for ApiKey {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}
