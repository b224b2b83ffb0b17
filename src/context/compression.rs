//! Context compression: fold older turns into a running summary
//!
//! A conversation is compressed when its window exceeds
//! `floor(max_tokens * threshold)`. Everything but the `keep_recent` newest
//! turns is summarized, merged into the stored summary, and deleted in one
//! store transaction. Compression is best-effort: any failure leaves the
//! conversation untouched and the caller builds its window from the
//! uncompressed turns.

use super::models::{ChatMessage, ConversationId, Turn, TurnId};
use super::summarizer::{Summarizer, SummarizerError};
use super::token_estimator::TokenCounter;
use super::window::{build_window, render_transcript};
use crate::metrics::METRICS;
use crate::store::ConversationStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Budget knobs for compression
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionSettings {
    pub max_tokens: usize,
    /// Fraction of `max_tokens` that triggers compression, in (0, 1]
    pub threshold: f64,
    pub keep_recent: usize,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            threshold: 0.8,
            keep_recent: 4,
        }
    }
}

impl CompressionSettings {
    /// Window size above which compression runs
    pub fn trigger_tokens(&self) -> usize {
        (self.max_tokens as f64 * self.threshold).floor() as usize
    }

    /// Largest merged summary kept without a second summarization pass
    pub fn summary_budget(&self) -> usize {
        self.max_tokens / 2
    }
}

/// The result of summarizing old turns, ready to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionPlan {
    pub summary: String,
    pub removed: Vec<TurnId>,
    pub resummarized: bool,
}

/// What [`CompressionEngine::maybe_compress`] did
#[derive(Debug, Clone, PartialEq)]
pub enum CompressionOutcome {
    /// Window was within budget
    NotNeeded,
    /// Over budget but too few turns to fold
    Skipped,
    Compressed { removed: usize, summary_tokens: usize },
    /// Summarization or persistence failed; nothing was changed
    Failed(String),
}

/// Decides when to compress and performs the summarize-and-truncate step
pub struct CompressionEngine {
    counter: TokenCounter,
    summarizer: Arc<dyn Summarizer>,
    settings: CompressionSettings,
}

impl CompressionEngine {
    pub fn new(
        counter: TokenCounter,
        summarizer: Arc<dyn Summarizer>,
        settings: CompressionSettings,
    ) -> Self {
        Self {
            counter,
            summarizer,
            settings,
        }
    }

    pub fn settings(&self) -> &CompressionSettings {
        &self.settings
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    pub fn needs_compression(&self, window: &[ChatMessage]) -> bool {
        self.counter.count_batch(window) > self.settings.trigger_tokens()
    }

    /// Summarize all but the newest `keep_recent` turns.
    ///
    /// Returns `Ok(None)` when there is nothing to fold. Performs at most two
    /// summarizer calls: one for the old turns and, if the merged summary is
    /// over [`CompressionSettings::summary_budget`], one to collapse it.
    pub async fn compress(
        &self,
        turns: &[Turn],
        existing_summary: Option<&str>,
    ) -> Result<Option<CompressionPlan>, SummarizerError> {
        let keep = self.settings.keep_recent;
        if turns.len() <= keep {
            return Ok(None);
        }

        let (old, _recent) = turns.split_at(turns.len() - keep);
        let fresh = self.summarizer.summarize(&render_transcript(old)).await?;

        let mut resummarized = false;
        let summary = match existing_summary.filter(|s| !s.trim().is_empty()) {
            Some(existing) => {
                let merged = format!("{}\n\n{}", existing, fresh);
                let budget = self.settings.summary_budget();
                if self.counter.count(&merged) > budget {
                    debug!("Merged summary over {} tokens, collapsing", budget);
                    resummarized = true;
                    let collapsed = self.summarizer.summarize(&merged).await?;
                    if self.counter.count(&collapsed) > budget {
                        warn!(
                            "Collapsed summary still over budget ({} > {} tokens)",
                            self.counter.count(&collapsed),
                            budget
                        );
                    }
                    collapsed
                } else {
                    merged
                }
            }
            None => fresh,
        };

        Ok(Some(CompressionPlan {
            summary,
            removed: old.iter().map(|t| t.id).collect(),
            resummarized,
        }))
    }

    /// Check the conversation's current window and compress it if needed.
    ///
    /// Never fails: errors are logged and reported as
    /// [`CompressionOutcome::Failed`] with the store left as it was.
    pub async fn maybe_compress(
        &self,
        store: &dyn ConversationStore,
        conversation_id: ConversationId,
        system_prompt: Option<&str>,
    ) -> CompressionOutcome {
        let outcome = self.try_compress(store, conversation_id, system_prompt).await;
        match &outcome {
            CompressionOutcome::NotNeeded => {}
            CompressionOutcome::Skipped => METRICS.record_compression("skipped"),
            CompressionOutcome::Compressed { removed, summary_tokens } => {
                info!(
                    "Compressed conversation {}: {} turns folded, summary {} tokens",
                    conversation_id, removed, summary_tokens
                );
                METRICS.record_compression("compressed");
            }
            CompressionOutcome::Failed(reason) => {
                warn!("Compression of conversation {} failed: {}", conversation_id, reason);
                METRICS.record_compression("failed");
            }
        }
        outcome
    }

    async fn try_compress(
        &self,
        store: &dyn ConversationStore,
        conversation_id: ConversationId,
        system_prompt: Option<&str>,
    ) -> CompressionOutcome {
        let conversation = match store.get_conversation(conversation_id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => return CompressionOutcome::Failed("conversation not found".to_string()),
            Err(e) => return CompressionOutcome::Failed(e.to_string()),
        };
        let turns = match store.list_turns(conversation_id).await {
            Ok(turns) => turns,
            Err(e) => return CompressionOutcome::Failed(e.to_string()),
        };

        let existing = conversation.stored_summary();
        let window = build_window(&turns, existing, system_prompt);
        if !self.needs_compression(&window) {
            return CompressionOutcome::NotNeeded;
        }

        let plan = match self.compress(&turns, existing).await {
            Ok(Some(plan)) => plan,
            Ok(None) => return CompressionOutcome::Skipped,
            Err(e) => return CompressionOutcome::Failed(e.to_string()),
        };

        if let Err(e) = store
            .apply_compression(conversation_id, &plan.summary, &plan.removed)
            .await
        {
            return CompressionOutcome::Failed(e.to_string());
        }

        CompressionOutcome::Compressed {
            removed: plan.removed.len(),
            summary_tokens: self.counter.count(&plan.summary),
        }
    }
}
