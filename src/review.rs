//! Review gate: the accept / regenerate / abandon loop over candidate sets.
//!
//! The gate is an explicit state machine. Any [`Reviewer`] can drive it; the
//! binary uses [`TerminalReviewer`], tests use scripted reviewers.

use std::future::Future;
use std::io::{BufRead, Write};

use crate::error::{GenerationError, ReviewError};
use crate::formats::Flashcard;
use crate::synthesize::{ChunkFailure, Generation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Accept,
    Regenerate,
    Abandon,
}

/// Answer to a round that produced no cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyDecision {
    Regenerate,
    Abandon,
}

pub trait Reviewer {
    fn review(&mut self, candidates: &[Flashcard], round: usize) -> std::io::Result<ReviewDecision>;

    fn review_empty(&mut self, round: usize) -> std::io::Result<EmptyDecision>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    UserAbandoned,
    /// The user gave up after a round produced no cards.
    EmptyGeneration,
    Limit(ReviewError),
}

#[derive(Debug)]
pub enum ReviewOutcome {
    Accepted {
        cards: Vec<Flashcard>,
        failed_chunks: Vec<ChunkFailure>,
        regenerations: usize,
    },
    Abandoned {
        reason: AbandonReason,
        regenerations: usize,
    },
}

#[derive(Debug)]
enum State {
    Generating,
    Generated(Generation),
    Empty,
    Accepted(Generation),
    Abandoned(AbandonReason),
}

#[derive(Debug, Clone)]
pub struct ReviewGate {
    max_regenerations: usize,
    regenerations: usize,
}

impl ReviewGate {
    pub fn new(max_regenerations: usize) -> Self {
        Self {
            max_regenerations,
            regenerations: 0,
        }
    }

    /// Runs rounds of `generate` until the reviewer accepts or the session is
    /// abandoned. Each round replaces the previous candidate set.
    ///
    /// `EmptyGeneration` is handed to the reviewer; any other generation error
    /// ends the session and is returned.
    pub async fn run<G, Fut>(
        &mut self,
        reviewer: &mut dyn Reviewer,
        mut generate: G,
    ) -> anyhow::Result<ReviewOutcome>
    where
        G: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<Generation, GenerationError>>,
    {
        let mut state = State::Generating;
        loop {
            state = match state {
                State::Generating => match generate(self.regenerations).await {
                    Ok(generation) => {
                        tracing::info!(
                            round = self.regenerations,
                            cards = generation.cards.len(),
                            "candidate set ready for review"
                        );
                        State::Generated(generation)
                    }
                    Err(GenerationError::EmptyGeneration) => {
                        tracing::warn!(round = self.regenerations, "generation produced no cards");
                        State::Empty
                    }
                    Err(err) => return Err(err.into()),
                },
                State::Generated(generation) => {
                    match reviewer.review(&generation.cards, self.regenerations)? {
                        ReviewDecision::Accept => State::Accepted(generation),
                        ReviewDecision::Regenerate => self.next_round(),
                        ReviewDecision::Abandon => State::Abandoned(AbandonReason::UserAbandoned),
                    }
                }
                State::Empty => match reviewer.review_empty(self.regenerations)? {
                    EmptyDecision::Regenerate => self.next_round(),
                    EmptyDecision::Abandon => State::Abandoned(AbandonReason::EmptyGeneration),
                },
                State::Accepted(generation) => {
                    tracing::info!(
                        cards = generation.cards.len(),
                        regenerations = self.regenerations,
                        "candidate set accepted"
                    );
                    return Ok(ReviewOutcome::Accepted {
                        cards: generation.cards,
                        failed_chunks: generation.failed_chunks,
                        regenerations: self.regenerations,
                    });
                }
                State::Abandoned(reason) => {
                    tracing::info!(
                        reason = ?reason,
                        regenerations = self.regenerations,
                        "session abandoned"
                    );
                    return Ok(ReviewOutcome::Abandoned {
                        reason,
                        regenerations: self.regenerations,
                    });
                }
            };
        }
    }

    fn next_round(&mut self) -> State {
        if self.regenerations >= self.max_regenerations {
            return State::Abandoned(AbandonReason::Limit(
                ReviewError::RegenerationLimitExceeded {
                    limit: self.max_regenerations,
                },
            ));
        }
        self.regenerations += 1;
        tracing::info!(
            round = self.regenerations,
            max = self.max_regenerations,
            "regenerating candidate set"
        );
        State::Generating
    }
}

/// Line-oriented prompts on a terminal (or any reader/writer pair).
pub struct TerminalReviewer<R, W> {
    input: R,
    output: W,
}

impl TerminalReviewer<std::io::StdinLock<'static>, std::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(std::io::stdin().lock(), std::io::stdout())
    }
}

impl<R: BufRead, W: Write> TerminalReviewer<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.output
    }

    /// Asks for a deck name until a non-empty one is typed.
    pub fn ask_deck(&mut self) -> std::io::Result<String> {
        loop {
            write!(self.output, "Enter the name of the Anki deck: ")?;
            self.output.flush()?;
            let Some(line) = self.read_line()? else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "no deck name given",
                ));
            };
            let deck = line.trim();
            if !deck.is_empty() {
                return Ok(deck.to_owned());
            }
            writeln!(self.output, "Deck name cannot be empty.")?;
        }
    }

    fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    fn ask(&mut self, prompt: &str, choices: &[(&str, char)]) -> std::io::Result<Option<char>> {
        loop {
            write!(self.output, "{prompt} ")?;
            self.output.flush()?;
            let Some(line) = self.read_line()? else {
                return Ok(None);
            };
            let answer = line.trim().to_lowercase();
            if let Some((_, key)) = choices
                .iter()
                .find(|(word, key)| answer == *word || answer == key.to_string())
            {
                return Ok(Some(*key));
            }
            let keys = choices
                .iter()
                .map(|(_, key)| key.to_string())
                .collect::<Vec<_>>()
                .join("/");
            writeln!(self.output, "Please answer {keys}.")?;
        }
    }
}

impl<R: BufRead, W: Write> Reviewer for TerminalReviewer<R, W> {
    fn review(&mut self, candidates: &[Flashcard], round: usize) -> std::io::Result<ReviewDecision> {
        writeln!(self.output)?;
        if round > 0 {
            writeln!(self.output, "Regenerated flashcards (round {round}):")?;
        } else {
            writeln!(self.output, "Generated flashcards:")?;
        }
        for (idx, card) in candidates.iter().enumerate() {
            writeln!(self.output, "{:>3}. Q: {}", idx + 1, card.front)?;
            writeln!(self.output, "     A: {}", card.back)?;
        }
        writeln!(self.output)?;

        let answer = self.ask(
            "Do you approve them? (y/n/q)",
            &[("yes", 'y'), ("no", 'n'), ("quit", 'q')],
        )?;
        Ok(match answer {
            Some('y') => ReviewDecision::Accept,
            Some('n') => ReviewDecision::Regenerate,
            _ => ReviewDecision::Abandon,
        })
    }

    fn review_empty(&mut self, _round: usize) -> std::io::Result<EmptyDecision> {
        writeln!(self.output)?;
        writeln!(self.output, "No flashcards could be generated from these notes.")?;
        let answer = self.ask("Try again? (r/q)", &[("retry", 'r'), ("quit", 'q')])?;
        Ok(match answer {
            Some('r') => EmptyDecision::Regenerate,
            _ => EmptyDecision::Abandon,
        })
    }
}
