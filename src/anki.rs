//! AnkiConnect client (JSON-RPC over local HTTP, protocol version 6).

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::SyncConfig;
use crate::error::RemoteError;
use crate::formats::Flashcard;
use crate::sync::RemoteDeck;

const API_VERSION: u32 = 6;
const FRONT_FIELD: &str = "Front";
const BACK_FIELD: &str = "Back";
const FINGERPRINT_TAG_PREFIX: &str = "cardsmith:";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AnkiConnect {
    client: reqwest::Client,
    endpoint: Url,
    note_type: String,
    extra_tags: Vec<String>,
    probe_timeout: Duration,
}

impl AnkiConnect {
    pub fn new(config: &SyncConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout.min(Duration::from_secs(3)))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: config.anki_url.clone(),
            note_type: config.note_type.clone(),
            extra_tags: config.extra_tags.clone(),
            probe_timeout: config.request_timeout.min(Duration::from_secs(3)),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        action: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<Option<T>, RemoteError> {
        let mut body = serde_json::json!({ "action": action, "version": API_VERSION });
        if let Some(params) = params
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("params".to_owned(), params);
        }

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|err| classify_transport_error(action, &err))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("{action}: AnkiConnect returned HTTP {status}");
            return Err(if status.is_server_error() {
                RemoteError::Transient(message)
            } else {
                RemoteError::Rejected(message)
            });
        }

        let response: ApiResponse<T> = response
            .json()
            .await
            .map_err(|err| classify_transport_error(action, &err))?;
        if let Some(error) = response.error {
            return Err(RemoteError::Rejected(format!("{action}: {error}")));
        }
        Ok(response.result)
    }

    fn note_tags(&self, card: &Flashcard) -> Vec<String> {
        let mut tags = card
            .tags
            .iter()
            .chain(self.extra_tags.iter())
            .map(|tag| sanitize_tag(tag))
            .filter(|tag| !tag.is_empty())
            .collect::<Vec<_>>();
        tags.push(fingerprint_tag(card));
        tags.sort();
        tags.dedup();
        tags
    }

    /// Anki's own duplicate check only compares the first field, so it is
    /// disabled; `contains` decides by fingerprint tag instead.
    fn note_params(&self, card: &Flashcard) -> serde_json::Value {
        serde_json::json!({
            "note": {
                "deckName": card.deck,
                "modelName": self.note_type,
                "fields": {
                    FRONT_FIELD: card.front,
                    BACK_FIELD: card.back,
                },
                "tags": self.note_tags(card),
                "options": {
                    "allowDuplicate": true,
                },
            }
        })
    }
}

#[async_trait]
impl RemoteDeck for AnkiConnect {
    async fn probe(&self) -> Result<(), RemoteError> {
        let version: Option<u32> = self
            .request("version", None, Some(self.probe_timeout))
            .await?;
        tracing::debug!(endpoint = %self.endpoint, version = ?version, "AnkiConnect reachable");
        Ok(())
    }

    async fn prepare(&self, deck: &str) -> Result<(), RemoteError> {
        let fields: Vec<String> = self
            .request(
                "modelFieldNames",
                Some(serde_json::json!({ "modelName": self.note_type })),
                None,
            )
            .await?
            .ok_or_else(|| RemoteError::Rejected(format!("note type not found: {}", self.note_type)))?;
        for required in [FRONT_FIELD, BACK_FIELD] {
            if !fields.iter().any(|field| field == required) {
                return Err(RemoteError::Rejected(format!(
                    "note type {} has no `{required}` field (fields: {})",
                    self.note_type,
                    fields.join(", ")
                )));
            }
        }

        let deck_id: Option<u64> = self
            .request("createDeck", Some(serde_json::json!({ "deck": deck })), None)
            .await?;
        tracing::debug!(deck, deck_id = ?deck_id, note_type = %self.note_type, "remote deck ready");
        Ok(())
    }

    async fn contains(&self, card: &Flashcard) -> Result<bool, RemoteError> {
        let query = format!(
            "deck:\"{}\" tag:{}",
            escape_query(&card.deck),
            fingerprint_tag(card)
        );
        let ids: Vec<u64> = self
            .request("findNotes", Some(serde_json::json!({ "query": query })), None)
            .await?
            .unwrap_or_default();
        Ok(!ids.is_empty())
    }

    async fn add(&self, card: &Flashcard) -> Result<(), RemoteError> {
        let note_id: Option<u64> = self
            .request("addNote", Some(self.note_params(card)), None)
            .await?;
        match note_id {
            Some(_) => Ok(()),
            None => Err(RemoteError::Rejected("addNote returned no note id".to_owned())),
        }
    }
}

pub fn fingerprint_tag(card: &Flashcard) -> String {
    format!("{FINGERPRINT_TAG_PREFIX}{}", card.fingerprint().short())
}

fn classify_transport_error(action: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_connect() {
        RemoteError::Unavailable(format!("{action}: {err}"))
    } else if err.is_timeout() {
        RemoteError::Transient(format!("{action}: {err}"))
    } else if err.is_decode() {
        RemoteError::Rejected(format!("{action}: malformed AnkiConnect response: {err}"))
    } else {
        RemoteError::Transient(format!("{action}: {err}"))
    }
}

/// Anki tags are whitespace separated.
fn sanitize_tag(tag: &str) -> String {
    tag.split_whitespace().collect::<Vec<_>>().join("_")
}

fn escape_query(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '"' | '*' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
