//! On-disk flashcard set: a JSON array written atomically, guarded by a
//! sibling lock file.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::fs;
use tokio::io::AsyncWriteExt as _;

use crate::error::StoreError;
use crate::formats::Flashcard;

#[derive(Debug, Clone)]
pub struct FlashcardStore {
    path: PathBuf,
}

/// Exclusive writer access to a store. Released on drop.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            tracing::warn!(lock = %self.path.display(), error = %err, "release store lock");
        }
    }
}

impl FlashcardStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Takes the writer lock, failing fast with `StoreBusy` when another
    /// session holds it.
    pub async fn lock(&self) -> Result<StoreLock, StoreError> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::WriteFailure {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&lock_path)
                    .await
                    .ok()
                    .map(|pid| pid.trim().to_owned())
                    .filter(|pid| !pid.is_empty())
                    .map(|pid| format!("pid {pid}"))
                    .unwrap_or_else(|| "unknown holder".to_owned());
                return Err(StoreError::StoreBusy {
                    lock: lock_path,
                    holder,
                });
            }
            Err(source) => {
                return Err(StoreError::WriteFailure {
                    path: lock_path,
                    source,
                });
            }
        };

        let lock = StoreLock { path: lock_path };
        let pid = std::process::id().to_string();
        let written = async {
            file.write_all(pid.as_bytes()).await?;
            file.flush().await
        };
        written
            .await
            .map_err(|source| StoreError::WriteFailure {
                path: lock.path.clone(),
                source,
            })?;
        tracing::debug!(lock = %lock.path.display(), "store lock acquired");
        Ok(lock)
    }

    /// Returns the saved set, or an empty one when nothing was saved yet.
    pub async fn load(&self) -> Result<Vec<Flashcard>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(store = %self.path.display(), "store file missing; empty set");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::ReadFailure {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let cards = parse_store(&bytes).map_err(|reason| StoreError::CorruptStore {
            path: self.path.clone(),
            reason,
        })?;
        tracing::info!(store = %self.path.display(), cards = cards.len(), "store loaded");
        Ok(cards)
    }

    /// Replaces the saved set with `cards`. Writes a temp file next to the
    /// store and renames it into place.
    pub async fn save(&self, lock: &StoreLock, cards: &[Flashcard]) -> Result<(), StoreError> {
        debug_assert_eq!(lock.path, self.lock_path());
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::WriteFailure {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let data = serde_json::to_vec_pretty(cards).map_err(|err| StoreError::WriteFailure {
            path: self.path.clone(),
            source: std::io::Error::other(err),
        })?;
        let tmp_path = self
            .path
            .with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));

        let written = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(source) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::WriteFailure {
                path: tmp_path,
                source,
            });
        }

        if let Err(source) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::WriteFailure {
                path: self.path.clone(),
                source,
            });
        }

        tracing::info!(store = %self.path.display(), cards = cards.len(), "store saved");
        Ok(())
    }
}

/// Cards saved by older releases: wrapped in `{"flashcards": [...]}`,
/// possibly without a deck, with the note text either inline or in an
/// Anki-style `fields` object.
#[derive(Deserialize)]
struct LegacyCard {
    #[serde(default, alias = "Front")]
    front: Option<String>,
    #[serde(default, alias = "Back")]
    back: Option<String>,
    #[serde(default)]
    fields: Option<LegacyFields>,
    #[serde(default, alias = "deckName")]
    deck: String,
    #[serde(default)]
    tags: BTreeSet<String>,
}

#[derive(Deserialize)]
struct LegacyFields {
    #[serde(default, rename = "Front", alias = "front")]
    front: Option<String>,
    #[serde(default, rename = "Back", alias = "back")]
    back: Option<String>,
}

impl LegacyCard {
    fn into_flashcard(self, idx: usize) -> Result<Flashcard, String> {
        let (front, back) = match self.fields {
            Some(fields) => (fields.front, fields.back),
            None => (self.front, self.back),
        };
        match (front, back) {
            (Some(front), Some(back)) => Ok(Flashcard {
                front,
                back,
                deck: self.deck,
                tags: self.tags,
            }),
            _ => Err(format!("card {idx} needs a front and a back")),
        }
    }
}

fn parse_store(bytes: &[u8]) -> Result<Vec<Flashcard>, String> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|err| format!("invalid json: {err}"))?;

    let cards = match value {
        serde_json::Value::Object(mut map) => {
            let Some(inner) = map.remove("flashcards") else {
                return Err("expected a JSON array of flashcards".to_owned());
            };
            let legacy: Vec<LegacyCard> = serde_json::from_value(inner)
                .map_err(|err| format!("invalid `flashcards` list: {err}"))?;
            legacy
                .into_iter()
                .enumerate()
                .map(|(idx, card)| card.into_flashcard(idx))
                .collect::<Result<Vec<_>, _>>()?
        }
        value => serde_json::from_value::<Vec<Flashcard>>(value)
            .map_err(|err| format!("invalid flashcard array: {err}"))?,
    };

    if let Some(idx) = cards
        .iter()
        .position(|card| card.front.trim().is_empty() || card.back.trim().is_empty())
    {
        return Err(format!("card {idx} has empty front or back"));
    }
    Ok(cards)
}
