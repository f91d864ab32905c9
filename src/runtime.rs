use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Sender;

use crate::config::InterviewConfig;
use crate::coordinator::{InterviewEvent, TurnCoordinator};
use crate::database::{ConversationStore, SqliteStore};
use crate::finalizer::Finalizer;
use crate::llm_client::{LlmClient, ModelInvoker};
use crate::prompt_cache::{system_prompt_key, LruPromptCache, PromptCache};

/// Process-wide wiring: config, store, model client, prompt cache, and the
/// event channel to the presentation layer. Coordinators are built per
/// conversation on top of this.
pub struct InterviewRuntime {
    pub config: InterviewConfig,
    pub store: Arc<dyn ConversationStore>,
    pub model: Arc<dyn ModelInvoker>,
    pub cache: Arc<dyn PromptCache>,
    event_tx: Sender<InterviewEvent>,
}

impl InterviewRuntime {
    pub fn bootstrap(config: InterviewConfig, event_tx: Sender<InterviewEvent>) -> Result<Self> {
        let store = SqliteStore::open(&config.database_path)
            .with_context(|| format!("failed to open database at {}", config.database_path))?;
        tracing::info!("Interview database initialized: {}", config.database_path);

        let model = LlmClient::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        );

        let cache = LruPromptCache::new(
            config.prompt_cache_capacity,
            Duration::from_secs(config.prompt_cache_ttl_secs),
        );

        Ok(Self {
            config,
            store: Arc::new(store),
            model: Arc::new(model),
            cache: Arc::new(cache),
            event_tx,
        })
    }

    /// Build the coordinator for one conversation.
    pub fn coordinator(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Arc<TurnCoordinator>> {
        TurnCoordinator::new(
            conversation_id,
            user_id,
            self.config.clone(),
            self.model.clone(),
            self.store.clone(),
            self.cache.clone(),
            self.event_tx.clone(),
        )
    }

    /// Safety-net finalization trigger for a conversation whose coordinator
    /// is gone. The pipeline is idempotent, so racing the coordinator's own
    /// invocation is harmless.
    pub fn finalizer(&self) -> Finalizer {
        Finalizer::new(self.store.clone(), self.model.clone(), &self.config)
    }

    /// Drop cached prompt material for a user whose profile changed.
    pub fn invalidate_prompts(&self, user_id: &str) {
        self.cache.invalidate(&system_prompt_key(user_id));
    }
}
