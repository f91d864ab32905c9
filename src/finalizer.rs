//! One-shot end-of-conversation pipeline.
//!
//! Invoked once by the coordinator when both end conditions hold, and again
//! as a safety net by external triggers. Idempotence comes from the stored
//! conversation status: the pipeline short-circuits when the status is
//! already terminal and only sets it as its own last step.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::time::{sleep, Duration};

use crate::config::InterviewConfig;
use crate::coordinator::{UiMessage, UiRole};
use crate::database::{ConversationStatus, ConversationStore, FinalizedFields};
use crate::llm_client::{ChatMessage, ModelInvoker};
use crate::progress::completion_percentage;
use crate::recovery;

const SUMMARY_SYSTEM_PROMPT: &str = "You write a two or three sentence closing summary of a \
finished interview transcript: who was interviewed, what was covered, and how it went. Reply \
with plain text only.";

pub struct Finalizer {
    store: Arc<dyn ConversationStore>,
    model: Arc<dyn ModelInvoker>,
    usage_threshold: u8,
    settle_delay: Duration,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        model: Arc<dyn ModelInvoker>,
        config: &InterviewConfig,
    ) -> Self {
        Self {
            store,
            model,
            usage_threshold: config.usage_completion_threshold,
            settle_delay: Duration::from_millis(config.settle_delay_ms),
        }
    }

    /// Run the pipeline. Individual sub-steps are caught and logged; only a
    /// missing conversation or a failed final persist surface as errors.
    pub async fn finalize(&self, conversation_id: &str, transcript: &[UiMessage]) -> Result<()> {
        let Some(meta) = self.store.load_meta(conversation_id)? else {
            anyhow::bail!("cannot finalize unknown conversation {conversation_id}");
        };
        if meta.status.is_terminal() {
            tracing::info!(conversation_id, "already finalized, skipping");
            return Ok(());
        }

        let ended_at = Utc::now();
        let duration_minutes = (ended_at - meta.started_at).num_minutes().max(0);

        // Absorb any in-flight summarizer patch, then do the authoritative
        // progress read.
        sleep(self.settle_delay).await;
        let completion = match self.store.load_progress(conversation_id) {
            Ok(Some(progress)) => completion_percentage(&progress.objectives),
            Ok(None) => {
                tracing::warn!(conversation_id, "no progress recorded, completion is 0%");
                0
            }
            Err(e) => {
                tracing::warn!(conversation_id, "progress re-read failed, completion is 0%: {e:#}");
                0
            }
        };

        let clean_transcript = clean_transcript(transcript);
        let user_word_count = count_user_words(transcript);

        if completion > self.usage_threshold {
            if let Err(e) = self.store.increment_usage(&meta.user_id) {
                tracing::warn!(conversation_id, "usage increment failed: {e:#}");
            }
        }

        let summary = if completion > 0 && !clean_transcript.is_empty() {
            match self.generate_summary(&clean_transcript).await {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!(conversation_id, "closing summary skipped: {e:#}");
                    String::new()
                }
            }
        } else {
            String::new()
        };

        self.store.save_finalized(
            conversation_id,
            &FinalizedFields {
                ended_at,
                duration_minutes,
                clean_transcript,
                completion_percentage: completion,
                user_word_count,
                summary,
                status: ConversationStatus::Completed,
            },
        )?;
        tracing::info!(conversation_id, completion, duration_minutes, "conversation finalized");
        Ok(())
    }

    async fn generate_summary(&self, transcript: &str) -> Result<String> {
        let raw = self
            .model
            .invoke(SUMMARY_SYSTEM_PROMPT, &[ChatMessage::user(transcript)])
            .await?;
        Ok(recovery::recover(&raw, recovery::ANSWER_FIELD, None)
            .trim()
            .to_string())
    }
}

/// Render the visible conversation as speaker-labeled plain text. Typing
/// placeholders are dropped; hidden primer turns never reach the transcript
/// in the first place.
pub fn clean_transcript(messages: &[UiMessage]) -> String {
    let mut lines = Vec::with_capacity(messages.len());
    for message in messages {
        if message.is_typing || message.text.trim().is_empty() {
            continue;
        }
        let speaker = match message.role {
            UiRole::User => "Candidate",
            UiRole::Assistant => "Interviewer",
        };
        lines.push(format!("{speaker}: {}", message.text.trim()));
    }
    lines.join("\n")
}

/// Words in user-authored turns only.
pub fn count_user_words(messages: &[UiMessage]) -> u32 {
    messages
        .iter()
        .filter(|m| m.role == UiRole::User && !m.is_typing)
        .map(|m| m.text.split_whitespace().count() as u32)
        .sum()
}
