use std::collections::HashSet;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubNote {
    pub deck: String,
    pub front: String,
    pub back: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    notes: Vec<StubNote>,
    decks: HashSet<String>,
}

/// Minimal AnkiConnect: version, modelFieldNames, createDeck, findNotes,
/// addNote. Notes whose front is in `reject_fronts` fail validation, and
/// `allowDuplicate: false` rejects a second note with the same front.
pub struct AnkiStub {
    pub url: String,
    state: Arc<Mutex<State>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl AnkiStub {
    pub fn spawn(reject_fronts: &[&str]) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start anki stub server");
        let addr = server.server_addr();
        let url = format!("http://{addr}");
        let state = Arc::new(Mutex::new(State::default()));
        let shared = Arc::clone(&state);
        let reject_fronts = reject_fronts
            .iter()
            .map(|front| (*front).to_owned())
            .collect::<HashSet<_>>();

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("invalid request body")
                            .with_status_code(400),
                    );
                    continue;
                }
                let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                let action = parsed.get("action").and_then(|v| v.as_str()).unwrap_or("");
                let params = parsed.get("params").cloned().unwrap_or(Value::Null);

                let reply = {
                    let mut state = shared.lock().expect("lock anki stub state");
                    handle_action(&mut state, &reject_fronts, action, &params)
                };
                let (result, error) = match reply {
                    Ok(result) => (result, Value::Null),
                    Err(error) => (Value::Null, Value::String(error)),
                };
                let response_body = serde_json::json!({ "result": result, "error": error });

                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("build header");
                let response = tiny_http::Response::from_string(response_body.to_string())
                    .with_status_code(200)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            url,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn notes(&self) -> Vec<StubNote> {
        self.state.lock().expect("lock anki stub state").notes.clone()
    }

    #[allow(dead_code)]
    pub fn decks(&self) -> HashSet<String> {
        self.state.lock().expect("lock anki stub state").decks.clone()
    }
}

impl Drop for AnkiStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_action(
    state: &mut State,
    reject_fronts: &HashSet<String>,
    action: &str,
    params: &Value,
) -> Result<Value, String> {
    match action {
        "version" => Ok(Value::from(6)),
        "modelFieldNames" => match params.get("modelName").and_then(|v| v.as_str()) {
            Some("Basic") => Ok(serde_json::json!(["Front", "Back"])),
            Some(other) => Err(format!("model was not found: {other}")),
            None => Err("missing modelName".to_owned()),
        },
        "createDeck" => {
            let deck = params.get("deck").and_then(|v| v.as_str()).unwrap_or("");
            state.decks.insert(deck.to_owned());
            Ok(Value::from(1))
        }
        "findNotes" => {
            let query = params.get("query").and_then(|v| v.as_str()).unwrap_or("");
            let deck = between(query, "deck:\"", "\"").unwrap_or("");
            let tag = query
                .split_whitespace()
                .find_map(|part| part.strip_prefix("tag:"))
                .unwrap_or("");
            let ids = state
                .notes
                .iter()
                .enumerate()
                .filter(|(_, note)| note.deck == deck && note.tags.iter().any(|t| t == tag))
                .map(|(idx, _)| Value::from(idx as u64 + 1))
                .collect::<Vec<_>>();
            Ok(Value::Array(ids))
        }
        "addNote" => {
            let note = params.get("note").cloned().unwrap_or(Value::Null);
            let text = |pointer: &str| {
                note.pointer(pointer)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_owned()
            };
            let stub_note = StubNote {
                deck: text("/deckName"),
                front: text("/fields/Front"),
                back: text("/fields/Back"),
                tags: note
                    .get("tags")
                    .and_then(|v| v.as_array())
                    .map(|tags| {
                        tags.iter()
                            .filter_map(|t| t.as_str().map(str::to_owned))
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            if !state.decks.contains(&stub_note.deck) {
                return Err("deck was not found".to_owned());
            }
            if reject_fronts.contains(&stub_note.front) {
                return Err("cannot create note because it is empty".to_owned());
            }
            // Anki compares only the first field when duplicates are disallowed.
            let allow_duplicate = note
                .pointer("/options/allowDuplicate")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !allow_duplicate
                && state
                    .notes
                    .iter()
                    .any(|n| n.deck == stub_note.deck && n.front == stub_note.front)
            {
                return Err("cannot create note because it is a duplicate".to_owned());
            }
            state.notes.push(stub_note);
            Ok(Value::from(state.notes.len() as u64))
        }
        other => Err(format!("unsupported action: {other}")),
    }
}

fn between<'a>(text: &'a str, begin: &str, end: &str) -> Option<&'a str> {
    let start = text.find(begin)? + begin.len();
    let rest = &text[start..];
    let end_rel = rest.find(end)?;
    Some(&rest[..end_rel])
}
