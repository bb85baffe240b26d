//! Completion backends behind the generation request/response boundary.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt as _;

use crate::cli::LlmEngine;
use crate::config::GenerationConfig;
use crate::error::GenerationError;
use crate::openai;

pub const NOTES_BEGIN: &str = "BEGIN_NOTES";
pub const NOTES_END: &str = "END_NOTES";

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sends one completion request. `input` carries the notes between
    /// `BEGIN_NOTES`/`END_NOTES` markers.
    async fn complete(&self, instructions: &str, input: &str) -> Result<String, GenerationError>;
}

pub fn build_backend(config: &GenerationConfig) -> anyhow::Result<Arc<dyn CompletionBackend>> {
    let backend: Arc<dyn CompletionBackend> = match config.engine {
        LlmEngine::Openai => {
            let api_key = config
                .api_key
                .as_ref()
                .map(|key| key.expose().trim().to_owned())
                .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
            let client = reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()
                .context("build http client")?;
            Arc::new(OpenAiBackend {
                client,
                endpoint: openai::responses_endpoint(&config.openai_base_url),
                api_key,
                model: config.model.clone(),
                temperature: config.temperature,
            })
        }
        LlmEngine::Command => {
            let program = config
                .command
                .clone()
                .ok_or_else(|| anyhow::anyhow!("missing --command (required when --engine=command)"))?;
            Arc::new(CommandBackend {
                program,
                args: config.command_args.clone(),
                model: config.model.clone(),
                timeout: config.request_timeout,
            })
        }
        LlmEngine::Heuristic => Arc::new(HeuristicBackend),
    };

    tracing::info!(
        engine = backend.name(),
        model = %config.model,
        "generation backend ready"
    );
    Ok(backend)
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, instructions: &str, input: &str) -> Result<String, GenerationError> {
        openai::responses_text(
            &self.client,
            &self.endpoint,
            &self.api_key,
            &self.model,
            instructions,
            input,
            self.temperature,
        )
        .await
    }
}

/// Runs an external program with the prompt on stdin and reads the
/// completion from stdout.
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    model: String,
    timeout: std::time::Duration,
}

#[async_trait]
impl CompletionBackend for CommandBackend {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn complete(&self, instructions: &str, input: &str) -> Result<String, GenerationError> {
        let program = &self.program;
        let mut child = tokio::process::Command::new(program)
            .args(&self.args)
            .env("CARDSMITH_MODEL", &self.model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                GenerationError::ModelUnavailable(format!("spawn generator command {program}: {err}"))
            })?;

        let prompt = format!("{instructions}\n\n{input}");
        let Some(mut stdin) = child.stdin.take() else {
            return Err(GenerationError::ModelUnavailable(
                "open generator stdin".to_owned(),
            ));
        };
        // A generator that exits without reading its input is judged by its
        // exit status below.
        if let Err(err) = stdin.write_all(prompt.as_bytes()).await
            && err.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(GenerationError::ModelUnavailable(format!(
                "write generator stdin: {err}"
            )));
        }
        drop(stdin);

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                GenerationError::ModelTimeout(format!(
                    "generator command {program} exceeded {:?}",
                    self.timeout
                ))
            })?
            .map_err(|err| GenerationError::ModelUnavailable(format!("wait generator: {err}")))?;

        // Only this chunk is affected; a missing program fails at spawn.
        if !output.status.success() {
            return Err(GenerationError::InvalidOutput(format!(
                "generator command failed: {program} ({})",
                output.status
            )));
        }
        String::from_utf8(output.stdout).map_err(|_| {
            GenerationError::InvalidOutput("generator stdout is not valid UTF-8".to_owned())
        })
    }
}

/// Offline generator: turns "X is Y." sentences and "label: value" lines into
/// question/answer pairs. Deterministic, used for dry runs and tests.
pub struct HeuristicBackend;

#[async_trait]
impl CompletionBackend for HeuristicBackend {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn complete(&self, _instructions: &str, input: &str) -> Result<String, GenerationError> {
        let notes = notes_section(input).unwrap_or(input);
        let cards = heuristic_cards(notes)
            .into_iter()
            .map(|(front, back)| serde_json::json!({ "front": front, "back": back }))
            .collect::<Vec<_>>();
        Ok(serde_json::Value::Array(cards).to_string())
    }
}

pub fn notes_section(input: &str) -> Option<&str> {
    let start = input.find(NOTES_BEGIN)? + NOTES_BEGIN.len();
    let rest = &input[start..];
    let end = rest.find(NOTES_END)?;
    Some(rest[..end].trim())
}

const COPULAS: [&str; 4] = [" is ", " are ", " was ", " were "];

fn heuristic_cards(notes: &str) -> Vec<(String, String)> {
    let mut cards = Vec::new();
    for line in notes.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some((label, value)) = line.split_once(": ")
            && !label.contains(' ')
            && !value.trim().is_empty()
        {
            cards.push((format!("{label}?"), value.trim().to_owned()));
            continue;
        }

        for sentence in split_sentences(line) {
            let Some((subject, verb, rest)) = COPULAS.iter().find_map(|copula| {
                sentence
                    .split_once(copula)
                    .map(|(subject, rest)| (subject, copula.trim(), rest))
            }) else {
                continue;
            };
            let subject = subject.trim();
            let rest = rest.trim().trim_end_matches(['.', '!', '?']);
            if subject.is_empty() || rest.is_empty() || subject.split_whitespace().count() > 6 {
                continue;
            }
            let verb = if subject.eq_ignore_ascii_case("they") {
                "are"
            } else {
                verb
            };
            cards.push((format!("What {verb} {subject}?"), rest.to_owned()));
        }
    }
    cards
}

fn split_sentences(line: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut iter = line.char_indices().peekable();
    while let Some((idx, ch)) = iter.next() {
        let at_boundary = matches!(ch, '.' | '!' | '?')
            && iter.peek().map(|(_, next)| next.is_whitespace()).unwrap_or(true);
        if at_boundary {
            let end = idx + ch.len_utf8();
            let sentence = line[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }
    let tail = line[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}
