//! Batched objective-progress summarization.
//!
//! An independent model pass reads the hidden objective-update notes
//! accumulated during the conversation (never the full transcript) and
//! proposes targeted field patches. The call is best-effort: callers log
//! failures and retry on the next turn.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::llm_client::{ChatMessage, ModelInvoker};
use crate::progress::{ObjectiveMap, ProgressPatch};
use crate::recovery;

const SUMMARIZER_SYSTEM_PROMPT: &str = "You maintain the objective state of a structured \
interview. You are given the current objective map and the objective-update notes recorded \
since it was last revised. Reply with a JSON array of patches, each of the form \
{\"path\": \"objective02.status\", \"value\": \"done\"}. Valid fields are status (tbc, \
current, done), count, target, and guidance. Reply with [] when nothing changed.";

pub struct ProgressSummarizer {
    model: Arc<dyn ModelInvoker>,
}

impl ProgressSummarizer {
    pub fn new(model: Arc<dyn ModelInvoker>) -> Self {
        Self { model }
    }

    /// Ask the model for patches against `current`. Returns an empty batch
    /// without a model call when there are no notes to summarize.
    pub async fn summarize_patches(
        &self,
        update_history: &[String],
        current: &ObjectiveMap,
    ) -> Result<Vec<ProgressPatch>> {
        if update_history.is_empty() {
            return Ok(Vec::new());
        }

        let current_json =
            serde_json::to_string_pretty(current).context("serializing current objectives")?;
        let mut content = format!("Current objectives:\n{current_json}\n\nUpdate notes, oldest first:\n");
        for note in update_history {
            content.push_str("- ");
            content.push_str(note);
            content.push('\n');
        }

        let raw = self
            .model
            .invoke(SUMMARIZER_SYSTEM_PROMPT, &[ChatMessage::user(content)])
            .await
            .context("progress summarizer call failed")?;

        parse_patches(&raw)
            .ok_or_else(|| anyhow::anyhow!("summarizer output had no usable patch list"))
    }
}

/// Pull a patch list out of summarizer output, accepting either a bare array
/// or an object wrapping one under `patches`. Unusable entries are skipped.
fn parse_patches(raw: &str) -> Option<Vec<ProgressPatch>> {
    let doc = recovery::parse_lenient(raw)?;
    let items = match doc {
        Value::Array(items) => items,
        Value::Object(ref map) => map.get("patches")?.as_array()?.clone(),
        _ => return None,
    };

    let mut patches = Vec::with_capacity(items.len());
    for item in items {
        let Some(entry) = item.as_object() else {
            tracing::debug!("patch entry is not an object, skipping");
            continue;
        };
        let Some(path) = entry.get("path").and_then(Value::as_str) else {
            tracing::debug!("patch entry has no path, skipping");
            continue;
        };
        let Some(value) = entry.get("value") else {
            tracing::debug!(path, "patch entry has no value, skipping");
            continue;
        };
        patches.push(ProgressPatch {
            path: path.to_string(),
            value: value.clone(),
        });
    }
    Some(patches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::default_objectives;
    use async_trait::async_trait;

    struct ScriptedModel {
        reply: String,
    }

    #[async_trait]
    impl ModelInvoker for ScriptedModel {
        async fn invoke(&self, _system_prompt: &str, _history: &[ChatMessage]) -> Result<String> {
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn parses_bare_patch_array() {
        let raw = r#"[{"path": "objective01.status", "value": "done"}]"#;
        let patches = parse_patches(raw).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].path, "objective01.status");
    }

    #[test]
    fn parses_fenced_wrapped_patches() {
        let raw = "```json\n{\"patches\": [{\"path\": \"objective02.count\", \"value\": 2},]}\n```";
        let patches = parse_patches(raw).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].value, serde_json::json!(2));
    }

    #[test]
    fn skips_unusable_entries() {
        let raw = r#"[{"path": "objective01.status", "value": "done"}, {"value": 1}, "junk"]"#;
        let patches = parse_patches(raw).unwrap();
        assert_eq!(patches.len(), 1);
    }

    #[tokio::test]
    async fn empty_history_short_circuits() {
        let summarizer = ProgressSummarizer::new(Arc::new(ScriptedModel {
            reply: "should never be called".to_string(),
        }));
        let patches = summarizer
            .summarize_patches(&[], &default_objectives())
            .await
            .unwrap();
        assert!(patches.is_empty());
    }

    #[tokio::test]
    async fn summarizes_notes_into_patches() {
        let summarizer = ProgressSummarizer::new(Arc::new(ScriptedModel {
            reply: "Sure!\n```json\n[{\"path\": \"objective01.status\", \"value\": \"done\"}]\n```"
                .to_string(),
        }));
        let patches = summarizer
            .summarize_patches(
                &["objective01 satisfied after three answers".to_string()],
                &default_objectives(),
            )
            .await
            .unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].value, serde_json::json!("done"));
    }

    #[tokio::test]
    async fn prose_only_reply_is_an_error() {
        let summarizer = ProgressSummarizer::new(Arc::new(ScriptedModel {
            reply: "I could not work that out, sorry.".to_string(),
        }));
        let result = summarizer
            .summarize_patches(&["note".to_string()], &default_objectives())
            .await;
        assert!(result.is_err());
    }
}
