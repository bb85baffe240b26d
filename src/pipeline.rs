//! Session orchestration: notes → chunks → cards → review → store → sync,
//! and the upload-only path that starts from the store.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

use crate::anki::AnkiConnect;
use crate::chunk::Chunker;
use crate::config::{SessionConfig, SyncConfig, UploadConfig};
use crate::engine;
use crate::formats::{Chunk, DocumentRef, Flashcard, SourceDocument};
use crate::normalize;
use crate::review::{AbandonReason, ReviewGate, ReviewOutcome, TerminalReviewer};
use crate::store::FlashcardStore;
use crate::sync::{SyncClient, SyncReport};
use crate::synthesize::Synthesizer;

/// How a run ended, when it did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Completed, but at least one document, chunk or card failed.
    CompletedWithFailures,
    Abandoned(AbandonReason),
}

impl RunStatus {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Completed | Self::Abandoned(AbandonReason::UserAbandoned) => 0,
            Self::CompletedWithFailures => 2,
            Self::Abandoned(_) => 1,
        }
    }

    fn from_failures(failures: usize) -> Self {
        if failures > 0 {
            Self::CompletedWithFailures
        } else {
            Self::Completed
        }
    }
}

/// One end-to-end run from source documents to an accepted or abandoned set.
#[derive(Debug, Clone)]
pub struct GenerationSession {
    pub deck: String,
    pub documents: Vec<PathBuf>,
    pub model: String,
    pub accepted: bool,
    pub regenerations: usize,
}

pub async fn run_generate<R: BufRead, W: Write>(
    config: SessionConfig,
    console: &mut TerminalReviewer<R, W>,
    cancel: CancellationToken,
) -> anyhow::Result<RunStatus> {
    let store = FlashcardStore::new(&config.store_path);
    let lock = store.lock().await.context("lock flashcard store")?;
    let backend = engine::build_backend(&config.generation).context("build generation backend")?;

    let deck = match &config.deck {
        Some(deck) => deck.clone(),
        None => console.ask_deck().context("read deck name")?,
    };

    let documents = collect_inputs(&config.inputs)?;
    let mut session = GenerationSession {
        deck: deck.clone(),
        documents: documents.clone(),
        model: config.generation.model.clone(),
        accepted: false,
        regenerations: 0,
    };
    tracing::info!(
        deck = %session.deck,
        documents = session.documents.len(),
        model = %session.model,
        "generation session started"
    );

    let (chunks, document_failures) =
        ingest(&documents, Chunker::new(config.generation.max_tokens)).await;
    if chunks.is_empty() {
        anyhow::bail!("no usable notes found in the given inputs");
    }

    let synthesizer = Synthesizer::from_config(backend, &config.generation);
    let mut gate = ReviewGate::new(config.max_regenerations);
    let outcome = {
        let synthesizer = &synthesizer;
        let chunks = chunks.as_slice();
        let deck = deck.as_str();
        let cancel = &cancel;
        gate.run(&mut *console, move |_round| synthesizer.generate(chunks, deck, cancel))
            .await
            .context("generate flashcards")?
    };

    let (cards, chunk_failures) = match outcome {
        ReviewOutcome::Accepted {
            cards,
            failed_chunks,
            regenerations,
        } => {
            session.accepted = true;
            session.regenerations = regenerations;
            (cards, failed_chunks.len())
        }
        ReviewOutcome::Abandoned {
            reason,
            regenerations,
        } => {
            session.regenerations = regenerations;
            let message = match &reason {
                AbandonReason::UserAbandoned => "Session abandoned; nothing was saved.".to_owned(),
                AbandonReason::EmptyGeneration => {
                    "No flashcards could be generated; nothing was saved.".to_owned()
                }
                AbandonReason::Limit(err) => format!("Session abandoned: {err}; nothing was saved."),
            };
            writeln!(console.writer(), "{message}")?;
            log_session(&session);
            return Ok(RunStatus::Abandoned(reason));
        }
    };

    store
        .save(&lock, &cards)
        .await
        .context("save flashcards")?;
    writeln!(
        console.writer(),
        "Saved {} flashcards to {}.",
        cards.len(),
        store.path().display()
    )?;
    log_session(&session);

    let unit_failures = document_failures + chunk_failures;
    if config.skip_upload {
        tracing::info!("upload skipped");
        return Ok(RunStatus::from_failures(unit_failures));
    }

    let report = upload(&cards, &deck, &config.sync, &cancel)
        .await
        .with_context(|| {
            format!(
                "upload flashcards (saved cards can be retried with `cardsmith upload --store {}`)",
                store.path().display()
            )
        })?;
    print_report(console.writer(), &report)?;
    Ok(RunStatus::from_failures(unit_failures + report.failures()))
}

pub async fn run_upload<R: BufRead, W: Write>(
    config: UploadConfig,
    console: &mut TerminalReviewer<R, W>,
    cancel: CancellationToken,
) -> anyhow::Result<RunStatus> {
    let store = FlashcardStore::new(&config.store_path);
    let _lock = store.lock().await.context("lock flashcard store")?;
    let cards = store.load().await.context("load flashcards")?;
    if cards.is_empty() {
        writeln!(
            console.writer(),
            "No flashcards in {}; nothing to upload.",
            store.path().display()
        )?;
        return Ok(RunStatus::Completed);
    }

    let deck = match &config.deck {
        Some(deck) => deck.clone(),
        None => console.ask_deck().context("read deck name")?,
    };
    let report = upload(&cards, &deck, &config.sync, &cancel)
        .await
        .context("upload flashcards")?;
    print_report(console.writer(), &report)?;
    Ok(RunStatus::from_failures(report.failures()))
}

async fn upload(
    cards: &[Flashcard],
    deck: &str,
    config: &SyncConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<SyncReport> {
    let remote = AnkiConnect::new(config)?;
    let client = SyncClient::from_config(Arc::new(remote), config);
    Ok(client.sync(cards, deck, cancel).await?)
}

/// Expands directories (recursively, sorted, hidden entries skipped).
pub fn collect_inputs(inputs: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        let metadata = std::fs::metadata(input)
            .with_context(|| format!("read input: {}", input.display()))?;
        if metadata.is_dir() {
            walk_dir(input, &mut files)?;
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn walk_dir(dir: &Path, files: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("read dir: {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("read dir entry: {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            walk_dir(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

/// Normalizes and chunks every document. A document that cannot be read or
/// parsed is skipped and counted.
async fn ingest(documents: &[PathBuf], chunker: Chunker) -> (Vec<Chunk>, usize) {
    let mut chunks = Vec::new();
    let mut failures = 0usize;

    for (ordinal, path) in documents.iter().enumerate() {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "document skipped");
                failures += 1;
                continue;
            }
        };
        let document = SourceDocument::new(path, bytes);
        let text = match normalize::normalize(&document) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "document skipped");
                failures += 1;
                continue;
            }
        };

        let before = chunks.len();
        let document_ref = DocumentRef {
            path: path.clone(),
            ordinal,
        };
        chunks.extend(chunker.chunks(&text, document_ref, before));
        if chunks.len() == before {
            tracing::info!(path = %path.display(), "document produced no chunks");
        } else {
            tracing::debug!(
                path = %path.display(),
                format = ?document.format,
                chunks = chunks.len() - before,
                "document chunked"
            );
        }
    }

    tracing::info!(
        documents = documents.len(),
        chunks = chunks.len(),
        failed_documents = failures,
        max_tokens = chunker.max_tokens(),
        "notes ingested"
    );
    (chunks, failures)
}

fn log_session(session: &GenerationSession) {
    tracing::info!(
        deck = %session.deck,
        documents = session.documents.len(),
        model = %session.model,
        accepted = session.accepted,
        regenerations = session.regenerations,
        "generation session finished"
    );
}

pub fn print_report(out: &mut impl Write, report: &SyncReport) -> std::io::Result<()> {
    writeln!(
        out,
        "Upload to deck \"{}\": {} created, {} duplicate-skipped, {} failed.",
        report.deck,
        report.created(),
        report.duplicates(),
        report.failures()
    )?;
    for entry in &report.entries {
        match &entry.outcome {
            crate::formats::SyncOutcome::Failed(reason) => writeln!(
                out,
                "  {:<17} {} ({reason})",
                entry.outcome.label(),
                entry.front
            )?,
            outcome => writeln!(out, "  {:<17} {}", outcome.label(), entry.front)?,
        }
    }
    Ok(())
}
