use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::GenerationConfig;
use crate::engine::{CompletionBackend, NOTES_BEGIN, NOTES_END};
use crate::error::GenerationError;
use crate::formats::{Chunk, Flashcard};

/// A chunk that produced no cards because of an error local to it.
#[derive(Debug, Clone)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub error: GenerationError,
}

/// Deduplicated candidate set for one generation round.
#[derive(Debug, Clone)]
pub struct Generation {
    pub cards: Vec<Flashcard>,
    pub failed_chunks: Vec<ChunkFailure>,
    pub duplicates_dropped: usize,
}

#[derive(Clone)]
pub struct Synthesizer {
    backend: Arc<dyn CompletionBackend>,
    concurrency: usize,
    retries: usize,
    backoff: Duration,
}

impl Synthesizer {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        concurrency: usize,
        retries: usize,
        backoff: Duration,
    ) -> Self {
        Self {
            backend,
            concurrency: concurrency.max(1),
            retries,
            backoff,
        }
    }

    pub fn from_config(backend: Arc<dyn CompletionBackend>, config: &GenerationConfig) -> Self {
        Self::new(backend, config.concurrency, config.retries, config.backoff)
    }

    /// Generates cards for every chunk, merges them in chunk order and drops
    /// later duplicates by fingerprint.
    ///
    /// `ModelUnavailable` aborts the whole round; other failures skip the
    /// affected chunk and are reported in [`Generation::failed_chunks`].
    pub async fn generate(
        &self,
        chunks: &[Chunk],
        deck: &str,
        cancel: &CancellationToken,
    ) -> Result<Generation, GenerationError> {
        let total_chunks = chunks.len();
        let concurrency = self.concurrency.min(total_chunks.max(1));
        tracing::info!(
            engine = self.backend.name(),
            chunks = total_chunks,
            concurrency = concurrency,
            retries = self.retries,
            "generate flashcards"
        );

        let mut join_set = tokio::task::JoinSet::new();
        let mut next_pos = 0usize;
        let mut results: Vec<Option<Vec<RawCard>>> = vec![None; total_chunks];
        let mut failed_chunks = Vec::new();

        while next_pos < total_chunks || !join_set.is_empty() {
            while next_pos < total_chunks && join_set.len() < concurrency {
                let pos = next_pos;
                let chunk = chunks[pos].clone();
                let backend = Arc::clone(&self.backend);
                let retries = self.retries;
                let backoff = self.backoff;

                join_set.spawn(async move {
                    tracing::debug!(chunk_index = chunk.index, "generate chunk");
                    let outcome = generate_chunk(backend.as_ref(), &chunk, retries, backoff).await;
                    (pos, outcome)
                });
                next_pos += 1;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    tracing::warn!("generation interrupted; discarding in-flight chunks");
                    return Err(GenerationError::Interrupted);
                }
                joined = join_set.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let (pos, outcome) = joined.map_err(|err| {
                GenerationError::ModelUnavailable(format!("join generation task: {err}"))
            })?;
            let chunk_index = chunks[pos].index;

            match outcome {
                Ok(cards) => {
                    tracing::debug!(chunk_index, cards = cards.len(), "chunk generated");
                    results[pos] = Some(cards);
                }
                Err(err @ GenerationError::ModelUnavailable(_)) => {
                    join_set.abort_all();
                    tracing::error!(chunk_index, error = %err, "model unavailable; aborting generation");
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(chunk_index, error = %err, "chunk skipped");
                    failed_chunks.push(ChunkFailure {
                        chunk_index,
                        error: err,
                    });
                    results[pos] = Some(Vec::new());
                }
            }
        }

        let mut seen = HashSet::new();
        let mut cards = Vec::new();
        let mut duplicates_dropped = 0usize;
        for raw in results.into_iter().flatten().flatten() {
            let card = Flashcard::new(raw.front, raw.back, deck).with_tags(raw.tags);
            if seen.insert(card.fingerprint()) {
                cards.push(card);
            } else {
                duplicates_dropped += 1;
            }
        }

        failed_chunks.sort_by_key(|f| f.chunk_index);
        tracing::info!(
            cards = cards.len(),
            duplicates_dropped,
            failed_chunks = failed_chunks.len(),
            "generation finished"
        );

        if cards.is_empty() {
            return Err(GenerationError::EmptyGeneration);
        }
        Ok(Generation {
            cards,
            failed_chunks,
            duplicates_dropped,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawCard {
    #[serde(alias = "Front", alias = "question")]
    front: String,
    #[serde(alias = "Back", alias = "answer")]
    back: String,
    #[serde(default)]
    tags: Vec<String>,
}

async fn generate_chunk(
    backend: &dyn CompletionBackend,
    chunk: &Chunk,
    retries: usize,
    backoff: Duration,
) -> Result<Vec<RawCard>, GenerationError> {
    let input = format!("{NOTES_BEGIN}\n{}\n{NOTES_END}", chunk.text);
    let mut strict = false;
    let mut timeouts = 0usize;

    loop {
        let prompt = instructions(strict);
        let parsed = match backend.complete(&prompt, &input).await {
            Ok(raw) => parse_cards(&raw),
            Err(err) => Err(err),
        };

        match parsed {
            Ok(cards) => return Ok(cards),
            Err(GenerationError::ModelTimeout(message)) if timeouts < retries => {
                timeouts += 1;
                let delay = backoff.saturating_mul(1 << (timeouts - 1).min(16));
                tracing::warn!(
                    chunk_index = chunk.index,
                    attempt = timeouts,
                    retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "model timeout; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(GenerationError::InvalidOutput(message)) if !strict => {
                tracing::warn!(
                    chunk_index = chunk.index,
                    error = %message,
                    "invalid model output; retrying with stricter prompt"
                );
                strict = true;
            }
            Err(err) => return Err(err),
        }
    }
}

fn instructions(strict: bool) -> String {
    let mut instructions = String::from(
        "You are a study assistant that writes flashcards.\n\
Task: Read the study notes between BEGIN_NOTES and END_NOTES and write question/answer flashcards.\n\
\n\
Hard rules:\n\
- Every card MUST be answerable from the notes alone.\n\
- One fact per card. Keep questions specific and answers short.\n\
- Keep the language of the notes.\n\
- Do not invent facts and do not add commentary.\n",
    );
    if strict {
        instructions.push_str(
            "\n\
CRITICAL:\n\
- Your previous reply could not be parsed.\n\
- Reply with a JSON array and nothing else: no prose, no markdown fences.\n\
- Every element MUST have a non-empty string `front` and a non-empty string `back`.\n\
- If the notes contain nothing worth a card, reply with [].\n",
        );
    }
    instructions.push_str(
        "\nOutput:\n\
- Output ONLY a JSON array.\n\
- Schema: [{\"front\":\"question\",\"back\":\"answer\"}]\n",
    );
    instructions
}

fn parse_cards(raw: &str) -> Result<Vec<RawCard>, GenerationError> {
    let trimmed = raw.trim();
    let cards: Vec<RawCard> = match serde_json::from_str(trimmed) {
        Ok(cards) => cards,
        Err(first_err) => {
            let span = extract_json_array(trimmed).ok_or_else(|| {
                GenerationError::InvalidOutput(format!("response is not a JSON array: {first_err}"))
            })?;
            serde_json::from_str(span).map_err(|err| {
                GenerationError::InvalidOutput(format!("parse flashcard array: {err}"))
            })?
        }
    };

    cards
        .into_iter()
        .enumerate()
        .map(|(idx, card)| {
            let front = card.front.trim();
            let back = card.back.trim();
            if front.is_empty() || back.is_empty() {
                return Err(GenerationError::InvalidOutput(format!(
                    "card {idx} has empty front or back"
                )));
            }
            Ok(RawCard {
                front: front.to_owned(),
                back: back.to_owned(),
                tags: card
                    .tags
                    .into_iter()
                    .map(|t| t.trim().to_owned())
                    .filter(|t| !t.is_empty())
                    .collect(),
            })
        })
        .collect()
}

fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}
