//! Reconciles a flashcard set with the remote flashcard application.
//!
//! A dead endpoint is detected once, up front, and fails the whole batch.
//! Failures of a single card are recorded and the batch continues.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError};
use crate::formats::{Flashcard, SyncOutcome};

/// The remote side of a sync, keyed by deck and card fingerprint.
#[async_trait]
pub trait RemoteDeck: Send + Sync {
    /// Single fast reachability check.
    async fn probe(&self) -> Result<(), RemoteError>;

    /// Makes `deck` ready to receive cards.
    async fn prepare(&self, deck: &str) -> Result<(), RemoteError>;

    async fn contains(&self, card: &Flashcard) -> Result<bool, RemoteError>;

    async fn add(&self, card: &Flashcard) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone)]
pub struct SyncEntry {
    pub front: String,
    pub outcome: SyncOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub deck: String,
    pub entries: Vec<SyncEntry>,
}

impl SyncReport {
    pub fn created(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Created))
    }

    pub fn duplicates(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::DuplicateSkipped))
    }

    pub fn failures(&self) -> usize {
        self.count(SyncOutcome::is_failure)
    }

    pub fn any_failures(&self) -> bool {
        self.failures() > 0
    }

    pub fn outcomes(&self) -> Vec<&SyncOutcome> {
        self.entries.iter().map(|e| &e.outcome).collect()
    }

    fn count(&self, pred: impl Fn(&SyncOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }
}

#[derive(Clone)]
pub struct SyncClient {
    remote: Arc<dyn RemoteDeck>,
    concurrency: usize,
    retries: usize,
    backoff: Duration,
}

const REMOTE_LOST: &str = "remote unavailable";
const INTERRUPTED: &str = "interrupted";

impl SyncClient {
    pub fn new(remote: Arc<dyn RemoteDeck>, concurrency: usize, retries: usize, backoff: Duration) -> Self {
        Self {
            remote,
            concurrency: concurrency.max(1),
            retries,
            backoff,
        }
    }

    pub fn from_config(remote: Arc<dyn RemoteDeck>, config: &SyncConfig) -> Self {
        Self::new(remote, config.concurrency, config.retries, config.backoff)
    }

    /// Uploads `cards` into `deck`, skipping cards already present.
    ///
    /// Returns one entry per card in input order. A card repeating an
    /// earlier card's fingerprint is skipped without a remote call. An empty
    /// input never touches the remote.
    pub async fn sync(
        &self,
        cards: &[Flashcard],
        deck: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport {
            deck: deck.to_owned(),
            entries: Vec::new(),
        };
        if cards.is_empty() {
            tracing::info!(deck, "nothing to upload");
            return Ok(report);
        }

        self.remote.probe().await.map_err(|err| match err {
            RemoteError::Rejected(msg) => SyncError::RemoteMisconfigured(msg),
            other => SyncError::RemoteUnavailable(other.to_string()),
        })?;
        self.remote.prepare(deck).await.map_err(|err| match err {
            RemoteError::Unavailable(msg) => SyncError::RemoteUnavailable(msg),
            other => SyncError::RemoteMisconfigured(other.to_string()),
        })?;

        let cards = cards.iter().map(|c| c.retarget(deck)).collect::<Vec<_>>();
        let total = cards.len();
        let mut outcomes: Vec<Option<SyncOutcome>> = vec![None; total];

        let mut seen = HashSet::new();
        let mut pending = Vec::with_capacity(total);
        for (pos, card) in cards.iter().enumerate() {
            if seen.insert(card.fingerprint()) {
                pending.push(pos);
            } else {
                outcomes[pos] = Some(SyncOutcome::DuplicateSkipped);
            }
        }

        let concurrency = self.concurrency.min(pending.len());
        tracing::info!(
            deck,
            cards = total,
            unique = pending.len(),
            concurrency,
            retries = self.retries,
            "upload flashcards"
        );

        let mut join_set = tokio::task::JoinSet::new();
        let mut pending = pending.into_iter().peekable();
        let mut stop_reason: Option<&'static str> = None;

        while (stop_reason.is_none() && pending.peek().is_some()) || !join_set.is_empty() {
            while stop_reason.is_none() && join_set.len() < concurrency {
                let Some(pos) = pending.next() else {
                    break;
                };
                let card = cards[pos].clone();
                let remote = Arc::clone(&self.remote);
                let retries = self.retries;
                let backoff = self.backoff;
                join_set.spawn(async move {
                    let outcome = upload_card(remote.as_ref(), &card, retries, backoff).await;
                    (pos, outcome)
                });
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled(), if stop_reason.is_none() => None,
                joined = join_set.join_next() => Some(joined),
            };
            let Some(joined) = joined else {
                tracing::warn!("upload interrupted; cards already created stay");
                join_set.abort_all();
                stop_reason = Some(INTERRUPTED);
                continue;
            };
            let Some(joined) = joined else {
                break;
            };
            let (pos, outcome) = match joined {
                Ok(done) => done,
                Err(err) if err.is_cancelled() => continue,
                Err(err) => {
                    tracing::error!(error = %err, "upload task failed");
                    continue;
                }
            };

            match outcome {
                Ok(outcome) => {
                    if let SyncOutcome::Failed(reason) = &outcome {
                        tracing::warn!(
                            fingerprint = %cards[pos].fingerprint(),
                            front = %cards[pos].front,
                            reason = %reason,
                            "card failed"
                        );
                    }
                    outcomes[pos] = Some(outcome);
                }
                Err(err) => {
                    tracing::error!(error = %err, "remote lost mid-batch; stopping upload");
                    join_set.abort_all();
                    stop_reason = Some(REMOTE_LOST);
                }
            }
        }

        let fallback = stop_reason.unwrap_or("upload task failed");
        report.entries = cards
            .iter()
            .zip(outcomes)
            .map(|(card, outcome)| SyncEntry {
                front: card.front.clone(),
                outcome: outcome.unwrap_or_else(|| SyncOutcome::Failed(fallback.to_owned())),
            })
            .collect();

        tracing::info!(
            deck,
            created = report.created(),
            duplicates = report.duplicates(),
            failed = report.failures(),
            "upload finished"
        );
        Ok(report)
    }
}

/// Uploads one card. Only a lost remote is returned as an error; every
/// other failure becomes a recorded outcome.
async fn upload_card(
    remote: &dyn RemoteDeck,
    card: &Flashcard,
    retries: usize,
    backoff: Duration,
) -> Result<SyncOutcome, RemoteError> {
    let mut attempt = 0usize;
    let mut add_attempted = false;

    loop {
        let result = async {
            if remote.contains(card).await? {
                return Ok(if add_attempted {
                    SyncOutcome::Created
                } else {
                    SyncOutcome::DuplicateSkipped
                });
            }
            add_attempted = true;
            remote.add(card).await?;
            Ok::<_, RemoteError>(SyncOutcome::Created)
        }
        .await;

        match result {
            Ok(outcome) => return Ok(outcome),
            Err(RemoteError::Transient(message)) if attempt < retries => {
                attempt += 1;
                let delay = backoff.saturating_mul(1 << (attempt - 1).min(16));
                tracing::debug!(
                    fingerprint = %card.fingerprint(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "transient upload failure; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(RemoteError::Transient(message)) | Err(RemoteError::Rejected(message)) => {
                return Ok(SyncOutcome::Failed(message));
            }
            Err(err @ RemoteError::Unavailable(_)) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;
    use crate::formats::Fingerprint;

    /// In-memory remote keyed by (deck, fingerprint).
    #[derive(Default)]
    struct MemoryRemote {
        notes: Mutex<HashSet<(String, Fingerprint)>>,
        reject_fronts: HashSet<String>,
        transient_failures: Mutex<HashMap<String, usize>>,
        down: bool,
        down_after_adds: Option<usize>,
        adds: Mutex<usize>,
        calls: Mutex<usize>,
    }

    impl MemoryRemote {
        fn note_count(&self) -> usize {
            self.notes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RemoteDeck for MemoryRemote {
        async fn probe(&self) -> Result<(), RemoteError> {
            *self.calls.lock().unwrap() += 1;
            if self.down {
                return Err(RemoteError::Unavailable("connection refused".to_owned()));
            }
            Ok(())
        }

        async fn prepare(&self, _deck: &str) -> Result<(), RemoteError> {
            *self.calls.lock().unwrap() += 1;
            Ok(())
        }

        async fn contains(&self, card: &Flashcard) -> Result<bool, RemoteError> {
            *self.calls.lock().unwrap() += 1;
            Ok(self
                .notes
                .lock()
                .unwrap()
                .contains(&(card.deck.clone(), card.fingerprint())))
        }

        async fn add(&self, card: &Flashcard) -> Result<(), RemoteError> {
            *self.calls.lock().unwrap() += 1;
            if let Some(limit) = self.down_after_adds
                && *self.adds.lock().unwrap() >= limit
            {
                return Err(RemoteError::Unavailable("connection refused".to_owned()));
            }
            if let Some(left) = self.transient_failures.lock().unwrap().get_mut(&card.front)
                && *left > 0
            {
                *left -= 1;
                return Err(RemoteError::Transient("timed out".to_owned()));
            }
            if self.reject_fronts.contains(&card.front) {
                return Err(RemoteError::Rejected("field is empty".to_owned()));
            }
            *self.adds.lock().unwrap() += 1;
            self.notes
                .lock()
                .unwrap()
                .insert((card.deck.clone(), card.fingerprint()));
            Ok(())
        }
    }

    fn cards(n: usize) -> Vec<Flashcard> {
        (1..=n)
            .map(|i| Flashcard::new(format!("Q{i}"), format!("A{i}"), "Store deck"))
            .collect()
    }

    fn client(remote: Arc<MemoryRemote>, concurrency: usize) -> SyncClient {
        SyncClient::new(remote, concurrency, 2, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn second_upload_is_all_duplicates() -> anyhow::Result<()> {
        let remote = Arc::new(MemoryRemote::default());
        let sync = client(Arc::clone(&remote), 3);
        let cards = cards(4);
        let cancel = CancellationToken::new();

        let first = sync.sync(&cards, "Geo", &cancel).await?;
        assert!(first.outcomes().iter().all(|o| **o == SyncOutcome::Created));

        let second = sync.sync(&cards, "Geo", &cancel).await?;
        assert!(
            second
                .outcomes()
                .iter()
                .all(|o| **o == SyncOutcome::DuplicateSkipped)
        );
        assert_eq!(remote.note_count(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_card_in_one_batch_is_added_once() -> anyhow::Result<()> {
        let remote = Arc::new(MemoryRemote::default());
        let mut batch = cards(2);
        batch.push(batch[0].clone());
        let report = client(Arc::clone(&remote), 3)
            .sync(&batch, "Geo", &CancellationToken::new())
            .await?;

        let outcomes = report.outcomes();
        assert_eq!(*outcomes[0], SyncOutcome::Created);
        assert_eq!(*outcomes[1], SyncOutcome::Created);
        assert_eq!(*outcomes[2], SyncOutcome::DuplicateSkipped);
        assert_eq!(*remote.adds.lock().unwrap(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn shared_front_with_different_backs_are_distinct_cards() -> anyhow::Result<()> {
        let remote = Arc::new(MemoryRemote::default());
        let batch = vec![
            Flashcard::new("What is Lyon?", "A major city", "Geo"),
            Flashcard::new("What is Lyon?", "The third-largest city in France", "Geo"),
        ];
        let report = client(Arc::clone(&remote), 2)
            .sync(&batch, "Geo", &CancellationToken::new())
            .await?;

        assert_eq!(report.created(), 2);
        assert_eq!(remote.note_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn one_rejected_card_does_not_abort_batch() -> anyhow::Result<()> {
        let remote = Arc::new(MemoryRemote {
            reject_fronts: HashSet::from(["Q3".to_owned()]),
            ..Default::default()
        });
        let report = client(Arc::clone(&remote), 2)
            .sync(&cards(5), "Geo", &CancellationToken::new())
            .await?;

        let outcomes = report.outcomes();
        for idx in [0, 1, 3, 4] {
            assert_eq!(*outcomes[idx], SyncOutcome::Created, "card {}", idx + 1);
        }
        assert!(matches!(outcomes[2], SyncOutcome::Failed(_)));
        assert!(report.any_failures());
        assert_eq!(remote.note_count(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn transient_failures_are_retried() -> anyhow::Result<()> {
        let remote = Arc::new(MemoryRemote {
            transient_failures: Mutex::new(HashMap::from([
                ("Q1".to_owned(), 2),
                ("Q2".to_owned(), 5),
            ])),
            ..Default::default()
        });
        let report = client(Arc::clone(&remote), 1)
            .sync(&cards(2), "Geo", &CancellationToken::new())
            .await?;

        assert_eq!(*report.outcomes()[0], SyncOutcome::Created);
        assert_eq!(
            *report.outcomes()[1],
            SyncOutcome::Failed("timed out".to_owned())
        );
        Ok(())
    }

    #[tokio::test]
    async fn dead_remote_short_circuits_batch() {
        let remote = Arc::new(MemoryRemote {
            down: true,
            ..Default::default()
        });
        let result = client(Arc::clone(&remote), 4)
            .sync(&cards(50), "Geo", &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(SyncError::RemoteUnavailable(_))));
        // Only the probe reached the remote.
        assert_eq!(*remote.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn remote_lost_mid_batch_reports_remaining_cards() -> anyhow::Result<()> {
        let remote = Arc::new(MemoryRemote {
            down_after_adds: Some(2),
            ..Default::default()
        });
        let report = client(Arc::clone(&remote), 1)
            .sync(&cards(5), "Geo", &CancellationToken::new())
            .await?;

        assert_eq!(report.created(), 2);
        assert_eq!(report.failures(), 3);
        assert!(
            report.entries[2..]
                .iter()
                .all(|e| e.outcome == SyncOutcome::Failed(REMOTE_LOST.to_owned()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_input_is_a_no_op() -> anyhow::Result<()> {
        let remote = Arc::new(MemoryRemote {
            down: true,
            ..Default::default()
        });
        let report = client(Arc::clone(&remote), 4)
            .sync(&[], "Geo", &CancellationToken::new())
            .await?;

        assert!(report.entries.is_empty());
        assert!(!report.any_failures());
        assert_eq!(*remote.calls.lock().unwrap(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn cards_are_filed_under_the_requested_deck() -> anyhow::Result<()> {
        let remote = Arc::new(MemoryRemote::default());
        client(Arc::clone(&remote), 2)
            .sync(&cards(1), "Geo", &CancellationToken::new())
            .await?;

        let notes = remote.notes.lock().unwrap();
        let (deck, fingerprint) = notes.iter().next().expect("one note");
        assert_eq!(deck, "Geo");
        assert_eq!(*fingerprint, cards(1)[0].retarget("Geo").fingerprint());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_upload_marks_cards_interrupted() -> anyhow::Result<()> {
        let remote = Arc::new(MemoryRemote::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = client(Arc::clone(&remote), 1)
            .sync(&cards(3), "Geo", &cancel)
            .await?;

        assert_eq!(report.entries.len(), 3);
        assert!(
            report
                .entries
                .iter()
                .all(|e| matches!(&e.outcome, SyncOutcome::Failed(r) if r == INTERRUPTED)
                    || e.outcome == SyncOutcome::Created)
        );
        Ok(())
    }
}
