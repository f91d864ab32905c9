//! Per-conversation turn-taking protocol.
//!
//! The coordinator owns the sequence of requests to the model for one
//! conversation: a hidden primer exchange before the user sees an input
//! box, a single-slot queue for messages submitted while a request is in
//! flight, reconstruction of authoritative history for every outbound
//! call, end-of-conversation detection, and exactly-once finalization.
//!
//! Phases: NotStarted -> PrimerInFlight -> Ready -> (Sending <-> Ready)* -> Finished.
//! All moves go through [`transition`], so an illegal move (say, a second
//! primer) is an error rather than a silent double-send.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::config::InterviewConfig;
use crate::database::{ConversationMeta, ConversationStatus, ConversationStore};
use crate::finalizer::Finalizer;
use crate::llm_client::{ChatMessage, ModelInvoker};
use crate::progress::{all_objectives_done, ProgressEngine};
use crate::prompt_cache::{opening_line_key, PromptCache};
use crate::recovery::{self, RecoveredTurn};
use crate::summarizer::ProgressSummarizer;

/// Synthetic first user turn. Sent to the model before the human sees an
/// input box; never rendered.
const PRIMER_MESSAGE: &str = "Hello, I'm ready to begin the interview.";

const TURN_FAILURE_REPLY: &str =
    "Sorry, I hit a problem on my end just now. Could you say that again?";

const PRIMER_FAILURE_REPLY: &str =
    "Sorry, I'm having a little trouble getting started. Go ahead whenever you're ready \
     and I'll catch up.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    NotStarted,
    PrimerInFlight,
    Ready,
    Sending,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiRole {
    User,
    Assistant,
}

impl UiRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UiRole::User => "user",
            UiRole::Assistant => "assistant",
        }
    }
}

/// One visible transcript entry.
#[derive(Debug, Clone)]
pub struct UiMessage {
    pub id: String,
    pub role: UiRole,
    pub text: String,
    /// Raw model payload behind an assistant turn; replayed verbatim so the
    /// model sees a consistent view of its own prior output.
    pub raw: Option<String>,
    pub is_typing: bool,
    /// Display copy of the primer's reply. The authoritative text lives in
    /// the recorded primer exchange, not here.
    pub is_opening: bool,
    /// Shown to the user but never replayed to the model (superseded queued
    /// messages, local error notices).
    pub local_only: bool,
}

impl UiMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: UiRole::User,
            text: text.into(),
            raw: None,
            is_typing: false,
            is_opening: false,
            local_only: false,
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: UiRole::Assistant,
            text: text.into(),
            raw: None,
            is_typing: false,
            is_opening: false,
            local_only: false,
        }
    }

    pub fn assistant_raw(text: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            raw: Some(raw.into()),
            ..Self::assistant_text(text)
        }
    }

    fn typing_placeholder() -> Self {
        Self {
            is_typing: true,
            is_opening: true,
            ..Self::assistant_text("")
        }
    }
}

/// What the presentation layer consumes.
#[derive(Debug, Clone)]
pub enum InterviewEvent {
    MessageAppended {
        role: String,
        text: String,
        is_typing: bool,
    },
    TypingReplaced {
        text: String,
    },
    ReadyToFinish,
    Error(String),
}

struct CoordinatorState {
    phase: TurnPhase,
    generation: u64,
    /// Id of the single queued message. A newer submission overwrites the
    /// slot; the superseded message stays visible but is never sent.
    queued: Option<String>,
    messages: Vec<UiMessage>,
    /// The full raw primer response, recorded for history reconstruction.
    primer_raw: Option<String>,
    /// Hidden objective-update notes accumulated for the summarizer.
    update_notes: Vec<String>,
}

pub struct TurnCoordinator {
    conversation_id: String,
    config: InterviewConfig,
    model: Arc<dyn ModelInvoker>,
    engine: Arc<ProgressEngine>,
    summarizer: ProgressSummarizer,
    store: Arc<dyn ConversationStore>,
    cache: Arc<dyn PromptCache>,
    finalizer: Finalizer,
    event_tx: flume::Sender<InterviewEvent>,
    state: Mutex<CoordinatorState>,
}

fn transition(state: &mut CoordinatorState, to: TurnPhase) -> Result<()> {
    use TurnPhase::*;
    let legal = matches!(
        (state.phase, to),
        (NotStarted, PrimerInFlight)
            | (PrimerInFlight, Ready)
            | (Ready, Sending)
            | (Sending, Ready)
            | (Ready, Finished)
    );
    if !legal {
        anyhow::bail!("illegal phase transition {:?} -> {:?}", state.phase, to);
    }
    tracing::debug!(from = ?state.phase, to = ?to, "phase transition");
    state.phase = to;
    Ok(())
}

impl TurnCoordinator {
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        config: InterviewConfig,
        model: Arc<dyn ModelInvoker>,
        store: Arc<dyn ConversationStore>,
        cache: Arc<dyn PromptCache>,
        event_tx: flume::Sender<InterviewEvent>,
    ) -> Result<Arc<Self>> {
        let conversation_id = conversation_id.into();
        let engine = Arc::new(ProgressEngine::new(store.clone()));
        let summarizer = ProgressSummarizer::new(model.clone());
        let finalizer = Finalizer::new(store.clone(), model.clone(), &config);

        store.create_conversation(&ConversationMeta {
            id: conversation_id.clone(),
            user_id: user_id.into(),
            agent_template: config.agent_template.clone(),
            started_at: Utc::now(),
            status: ConversationStatus::Active,
        })?;
        engine.initialize(&conversation_id)?;

        Ok(Arc::new(Self {
            conversation_id,
            config,
            model,
            engine,
            summarizer,
            store,
            cache,
            finalizer,
            event_tx,
            state: Mutex::new(CoordinatorState {
                phase: TurnPhase::NotStarted,
                generation: 0,
                queued: None,
                messages: Vec::new(),
                primer_raw: None,
                update_notes: Vec::new(),
            }),
        }))
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn phase(&self) -> TurnPhase {
        self.state.lock().await.phase
    }

    pub async fn messages(&self) -> Vec<UiMessage> {
        self.state.lock().await.messages.clone()
    }

    /// Kick off the conversation: show the cached opening line (when one
    /// exists) behind a short typing placeholder, and issue the hidden
    /// primer exchange concurrently.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let (cached_opening, generation) = {
            let mut state = self.state.lock().await;
            transition(&mut state, TurnPhase::PrimerInFlight)?;
            state.generation += 1;
            let generation = state.generation;

            let cached = if state.messages.is_empty() {
                self.cache
                    .get(&opening_line_key(&self.config.agent_template))
            } else {
                None
            };
            if cached.is_some() {
                state.messages.push(UiMessage::typing_placeholder());
                self.emit(InterviewEvent::MessageAppended {
                    role: UiRole::Assistant.as_str().to_string(),
                    text: String::new(),
                    is_typing: true,
                });
            }
            (cached, generation)
        };

        if let Some(line) = cached_opening {
            let this = Arc::clone(self);
            let delay = Duration::from_millis(this.config.opening_line_delay_ms);
            tokio::spawn(async move {
                sleep(delay).await;
                let mut state = this.state.lock().await;
                if state.generation != generation {
                    return;
                }
                if let Some(placeholder) = state
                    .messages
                    .iter_mut()
                    .find(|m| m.is_opening && m.is_typing)
                {
                    placeholder.text = line.clone();
                    placeholder.is_typing = false;
                    this.emit(InterviewEvent::TypingReplaced { text: line });
                }
            });
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_primer(generation).await;
        });
        Ok(())
    }

    /// Accept a user submission. The message always lands in the visible
    /// transcript; whether it is sent now or queued depends on the phase.
    pub async fn submit(self: &Arc<Self>, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        let send_now = {
            let mut state = self.state.lock().await;
            if state.phase == TurnPhase::Finished {
                tracing::debug!(
                    conversation_id = %self.conversation_id,
                    "submission after finish ignored"
                );
                return Ok(());
            }

            let message = UiMessage::user_text(text.clone());
            let message_id = message.id.clone();
            state.messages.push(message);
            self.emit(InterviewEvent::MessageAppended {
                role: UiRole::User.as_str().to_string(),
                text,
                is_typing: false,
            });

            match state.phase {
                TurnPhase::Ready => true,
                _ => {
                    // Single-slot queue: the latest submission wins. The
                    // superseded message stays visible but is never sent.
                    if let Some(previous_id) = state.queued.replace(message_id) {
                        if let Some(previous) =
                            state.messages.iter_mut().find(|m| m.id == previous_id)
                        {
                            previous.local_only = true;
                        }
                        tracing::debug!(
                            conversation_id = %self.conversation_id,
                            "queued message superseded by newer submission"
                        );
                    }
                    false
                }
            }
        };

        if send_now {
            self.send_turn().await?;
        }
        Ok(())
    }

    async fn run_primer(self: Arc<Self>, generation: u64) {
        let result = self
            .model
            .invoke(
                &self.config.system_prompt,
                &[ChatMessage::user(PRIMER_MESSAGE)],
            )
            .await;

        let (drained, noted) = {
            let mut state = self.state.lock().await;
            if state.generation != generation || state.phase != TurnPhase::PrimerInFlight {
                tracing::debug!(
                    conversation_id = %self.conversation_id,
                    "stale primer response discarded"
                );
                return;
            }

            let mut noted = false;
            match result {
                Ok(raw) => {
                    let recovered = recovery::recover_structured(&raw);
                    noted = self.record_objectives(&mut state, &recovered);

                    let has_opening = state.messages.iter().any(|m| m.is_opening);
                    if !has_opening {
                        let opening = UiMessage {
                            is_opening: true,
                            ..UiMessage::assistant_text(recovered.answer_text.clone())
                        };
                        state.messages.push(opening);
                        self.emit(InterviewEvent::MessageAppended {
                            role: UiRole::Assistant.as_str().to_string(),
                            text: recovered.answer_text,
                            is_typing: false,
                        });
                    }
                    state.primer_raw = Some(raw);
                }
                Err(e) => {
                    // Failure still unblocks the state machine; the
                    // conversation must never be stuck on the primer.
                    tracing::warn!(
                        conversation_id = %self.conversation_id,
                        "primer call failed: {e:#}"
                    );
                    if !state.messages.iter().any(|m| m.is_opening) {
                        let mut notice = UiMessage::assistant_text(PRIMER_FAILURE_REPLY);
                        notice.local_only = true;
                        notice.is_opening = true;
                        state.messages.push(notice);
                        self.emit(InterviewEvent::MessageAppended {
                            role: UiRole::Assistant.as_str().to_string(),
                            text: PRIMER_FAILURE_REPLY.to_string(),
                            is_typing: false,
                        });
                    }
                    self.emit(InterviewEvent::Error(e.to_string()));
                }
            }

            if let Err(e) = transition(&mut state, TurnPhase::Ready) {
                tracing::error!("primer resolution could not unblock: {e:#}");
            }
            (state.queued.is_some(), noted)
        };

        if noted {
            self.spawn_summarizer();
        }
        if drained {
            if let Err(e) = self.send_turn().await {
                tracing::error!(
                    conversation_id = %self.conversation_id,
                    "queued first turn failed: {e:#}"
                );
            }
        }
    }

    /// Run one ordinary turn, then keep draining the queue while a message
    /// is pending.
    async fn send_turn(self: &Arc<Self>) -> Result<()> {
        loop {
            let history = {
                let mut state = self.state.lock().await;
                if state.phase != TurnPhase::Ready {
                    // An in-flight turn will drain the queue when it lands.
                    return Ok(());
                }
                transition(&mut state, TurnPhase::Sending)?;
                state.queued = None;
                build_history(&state)
            };

            let result = self.model.invoke(&self.config.system_prompt, &history).await;

            let (answer, noted) = {
                let mut state = self.state.lock().await;
                let outcome = match result {
                    Ok(raw) => {
                        let recovered = recovery::recover_structured(&raw);
                        let answer_text = if recovered.answer_text.trim().is_empty() {
                            TURN_FAILURE_REPLY.to_string()
                        } else {
                            recovered.answer_text.clone()
                        };
                        let noted = self.record_objectives(&mut state, &recovered);
                        state
                            .messages
                            .push(UiMessage::assistant_raw(answer_text.clone(), raw));
                        self.emit(InterviewEvent::MessageAppended {
                            role: UiRole::Assistant.as_str().to_string(),
                            text: answer_text.clone(),
                            is_typing: false,
                        });
                        (Some(answer_text), noted)
                    }
                    Err(e) => {
                        tracing::warn!(
                            conversation_id = %self.conversation_id,
                            "turn call failed: {e:#}"
                        );
                        let mut notice = UiMessage::assistant_text(TURN_FAILURE_REPLY);
                        notice.local_only = true;
                        state.messages.push(notice);
                        self.emit(InterviewEvent::MessageAppended {
                            role: UiRole::Assistant.as_str().to_string(),
                            text: TURN_FAILURE_REPLY.to_string(),
                            is_typing: false,
                        });
                        self.emit(InterviewEvent::Error(e.to_string()));
                        (None, false)
                    }
                };
                transition(&mut state, TurnPhase::Ready)?;
                outcome
            };

            if noted {
                self.spawn_summarizer();
            }

            if let Some(answer) = answer {
                self.maybe_finish(&answer).await?;
            }

            let pending = {
                let state = self.state.lock().await;
                state.phase == TurnPhase::Ready && state.queued.is_some()
            };
            if !pending {
                return Ok(());
            }
        }
    }

    /// End detection: a closing phrase in the latest answer AND every
    /// objective done. Either alone is insufficient. A short grace delay
    /// lets an in-flight patch settle; the explicit re-read decides.
    async fn maybe_finish(self: &Arc<Self>, answer: &str) -> Result<()> {
        if !self.contains_closing_phrase(answer) {
            return Ok(());
        }
        if !self.objectives_all_done() {
            return Ok(());
        }

        sleep(Duration::from_millis(self.config.finalize_grace_ms)).await;
        if !self.objectives_all_done() {
            tracing::debug!(
                conversation_id = %self.conversation_id,
                "objectives regressed during grace period, not finishing"
            );
            return Ok(());
        }

        let transcript = {
            let mut state = self.state.lock().await;
            if state.phase != TurnPhase::Ready {
                // The user kept talking during the grace period.
                return Ok(());
            }
            transition(&mut state, TurnPhase::Finished)?;
            state.messages.clone()
        };
        self.emit(InterviewEvent::ReadyToFinish);

        if let Err(e) = self.finalizer.finalize(&self.conversation_id, &transcript).await {
            tracing::error!(
                conversation_id = %self.conversation_id,
                "finalizer failed: {e:#}"
            );
        }
        Ok(())
    }

    fn contains_closing_phrase(&self, answer: &str) -> bool {
        let lowered = answer.to_lowercase();
        self.config
            .closing_phrases
            .iter()
            .any(|phrase| lowered.contains(&phrase.to_lowercase()))
    }

    fn objectives_all_done(&self) -> bool {
        match self.store.load_progress(&self.conversation_id) {
            Ok(Some(progress)) => all_objectives_done(&progress.objectives),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    "progress read failed during end detection: {e:#}"
                );
                false
            }
        }
    }

    /// Store whatever progress information the turn carried. Returns true
    /// when a new objective-update note was recorded, so the caller knows to
    /// kick off a summarizer pass.
    fn record_objectives(&self, state: &mut CoordinatorState, recovered: &RecoveredTurn) -> bool {
        if let Some(ref objectives) = recovered.objectives {
            if let Ok(json) = serde_json::to_string(objectives) {
                state.update_notes.push(json);
            }
            match self
                .engine
                .apply_recovered(&self.conversation_id, objectives.clone())
            {
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    conversation_id = %self.conversation_id,
                    "inline objective map not stored: {e:#}"
                ),
            }
            true
        } else if let Some(update) = recovered
            .auxiliary
            .get("objectiveUpdate")
            .and_then(Value::as_str)
        {
            state.update_notes.push(update.to_string());
            true
        } else {
            false
        }
    }

    /// Best-effort batched progress summarization. Failures are logged and
    /// retried on the next turn.
    fn spawn_summarizer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let notes = {
                let state = this.state.lock().await;
                state.update_notes.clone()
            };
            if notes.is_empty() {
                return;
            }
            let progress = match this.engine.initialize(&this.conversation_id) {
                Ok(progress) => progress,
                Err(e) => {
                    tracing::warn!("progress unavailable for summarizer: {e:#}");
                    return;
                }
            };
            match this
                .summarizer
                .summarize_patches(&notes, &progress.objectives)
                .await
            {
                Ok(patches) => {
                    if patches.is_empty() {
                        return;
                    }
                    if let Err(e) =
                        this.engine
                            .apply_patches(&this.conversation_id, &patches, progress.revision)
                    {
                        tracing::warn!("progress patches not applied: {e:#}");
                    }
                }
                Err(e) => {
                    tracing::warn!("progress summarization skipped this cycle: {e:#}");
                }
            }
        });
    }

    fn emit(&self, event: InterviewEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Rebuild the outbound history: the hidden primer exchange (authoritative
/// raw response, never the cosmetic display text) followed by every visible
/// non-local exchange.
fn build_history(state: &CoordinatorState) -> Vec<ChatMessage> {
    let mut history = vec![ChatMessage::user(PRIMER_MESSAGE)];
    if let Some(ref raw) = state.primer_raw {
        history.push(ChatMessage::assistant(raw.clone()));
    }
    for message in &state.messages {
        if message.is_typing || message.local_only || message.is_opening {
            continue;
        }
        let content = message.raw.clone().unwrap_or_else(|| message.text.clone());
        history.push(match message.role {
            UiRole::User => ChatMessage::user(content),
            UiRole::Assistant => ChatMessage::assistant(content),
        });
    }
    history
}
