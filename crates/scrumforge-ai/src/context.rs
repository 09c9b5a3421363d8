//! Context window budgeting
//!
//! Fits a conversation into `context_window - reserved_output_tokens` while
//! always keeping the system instruction and the newest message. When the
//! full conversation does not fit, interior messages are re-admitted newest
//! first and admission stops at the first one that would overflow, so the
//! kept history is a contiguous suffix.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::error::{AiError, Result};
use crate::models::{join_contents, ChatMessage, Role};
use crate::provider::Provider;

/// Default share of the budget above which a near-limit warning is logged
pub const DEFAULT_NEAR_LIMIT_RATIO: f64 = 0.9;

/// Outcome of fitting a conversation into a budget
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetedContext {
    pub messages: Vec<ChatMessage>,
    /// Estimated input tokens of `messages`
    pub estimated_tokens: usize,
    /// Input token budget that was applied
    pub budget: usize,
    /// Interior messages left out
    pub dropped: usize,
    /// Usage exceeded the near-limit ratio without exceeding the budget
    pub near_limit: bool,
    /// Even the pinned messages exceed the budget; returned unchanged
    pub over_budget: bool,
}

/// Trims conversation history to a token budget
#[derive(Debug, Clone)]
pub struct ContextBudgeter {
    near_limit_ratio: f64,
}

impl Default for ContextBudgeter {
    fn default() -> Self {
        Self::new(DEFAULT_NEAR_LIMIT_RATIO)
    }
}

impl ContextBudgeter {
    pub fn new(near_limit_ratio: f64) -> Self {
        Self { near_limit_ratio }
    }

    pub fn near_limit_ratio(&self) -> f64 {
        self.near_limit_ratio
    }

    /// Fit an already-assembled message list. A leading system message and
    /// the final message are pinned; everything between is history.
    pub fn fit_messages(
        &self,
        provider: &dyn Provider,
        model: Option<&str>,
        messages: &[ChatMessage],
        context_window: usize,
        reserved_output_tokens: usize,
    ) -> Result<BudgetedContext> {
        let (latest, rest) = messages
            .split_last()
            .ok_or_else(|| AiError::InvalidRequest("request has no messages".to_string()))?;

        let (system, history) = match rest.split_first() {
            Some((first, tail)) if first.role == Role::System => (Some(first), tail),
            _ => (None, rest),
        };

        self.fit(
            provider,
            model,
            system,
            history,
            latest,
            context_window,
            reserved_output_tokens,
        )
    }

    /// Fit `system + history + latest` into the budget.
    ///
    /// Returns [`AiError::ContextBudgetInfeasible`] only when the reserved
    /// output leaves no input budget at all. If the pinned pair alone is over
    /// budget it is returned unchanged with `over_budget` set.
    #[allow(clippy::too_many_arguments)]
    pub fn fit(
        &self,
        provider: &dyn Provider,
        model: Option<&str>,
        system: Option<&ChatMessage>,
        history: &[ChatMessage],
        latest: &ChatMessage,
        context_window: usize,
        reserved_output_tokens: usize,
    ) -> Result<BudgetedContext> {
        let estimate = |messages: &[ChatMessage]| -> Result<usize> {
            provider.count_tokens(&join_contents(messages), model)
        };

        let pinned = assemble(system, std::iter::empty(), latest);
        let budget = match context_window.checked_sub(reserved_output_tokens) {
            Some(budget) if budget > 0 => budget,
            _ => {
                return Err(AiError::ContextBudgetInfeasible {
                    required: estimate(&pinned)?,
                    budget: 0,
                })
            }
        };

        let full = assemble(system, history.iter(), latest);
        let full_tokens = estimate(&full)?;
        if full_tokens <= budget {
            let near_limit = self.is_near_limit(full_tokens, budget);
            if near_limit {
                warn!(
                    tokens = full_tokens,
                    budget, "Context usage is close to the model limit"
                );
            }
            return Ok(BudgetedContext {
                messages: full,
                estimated_tokens: full_tokens,
                budget,
                dropped: 0,
                near_limit,
                over_budget: false,
            });
        }

        let pinned_tokens = estimate(&pinned)?;
        if pinned_tokens > budget {
            warn!(
                tokens = pinned_tokens,
                budget, "System instruction and latest message alone exceed the context budget"
            );
            return Ok(BudgetedContext {
                messages: pinned,
                estimated_tokens: pinned_tokens,
                budget,
                dropped: history.len(),
                near_limit: false,
                over_budget: true,
            });
        }

        let mut kept: VecDeque<&ChatMessage> = VecDeque::new();
        let mut kept_tokens = pinned_tokens;
        for message in history.iter().rev() {
            kept.push_front(message);
            let candidate = assemble(system, kept.iter().copied(), latest);
            let tokens = estimate(&candidate)?;
            if tokens > budget {
                kept.pop_front();
                break;
            }
            kept_tokens = tokens;
        }

        let dropped = history.len() - kept.len();
        let near_limit = self.is_near_limit(kept_tokens, budget);
        if near_limit {
            warn!(
                tokens = kept_tokens,
                budget, "Context usage is close to the model limit"
            );
        }
        debug!(
            kept = kept.len(),
            dropped,
            tokens = kept_tokens,
            budget,
            "Trimmed conversation history to fit context"
        );

        Ok(BudgetedContext {
            messages: assemble(system, kept.into_iter(), latest),
            estimated_tokens: kept_tokens,
            budget,
            dropped,
            near_limit,
            over_budget: false,
        })
    }

    fn is_near_limit(&self, tokens: usize, budget: usize) -> bool {
        tokens as f64 > budget as f64 * self.near_limit_ratio
    }
}

fn assemble<'a>(
    system: Option<&'a ChatMessage>,
    interior: impl Iterator<Item = &'a ChatMessage>,
    latest: &'a ChatMessage,
) -> Vec<ChatMessage> {
    system
        .into_iter()
        .chain(interior)
        .chain(std::iter::once(latest))
        .cloned()
        .collect()
}
