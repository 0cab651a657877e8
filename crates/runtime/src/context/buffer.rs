//! Token-aware in-memory message window for a single agent task.
//!
//! Purely in-memory; nothing here suspends. The buffer holds messages in
//! temporal order, serves bounded windows for prompt assembly, and trims
//! itself by importance once it overflows.

use parking_lot::RwLock;

use crate::config::ContextConfig;
use crate::types::{Message, MessageRole};

/// Estimate the token cost of a content string.
///
/// JSON-looking or code-fenced content is denser per token, so it divides by
/// 3 instead of 4. Empty content costs nothing. This heuristic is part of
/// the windowing contract; do not swap in a real tokenizer.
pub fn estimate_tokens(content: &str) -> usize {
    if content.is_empty() {
        return 0;
    }
    let divisor = if content.starts_with('{') || content.starts_with('[') || content.contains("```")
    {
        3
    } else {
        4
    };
    content.len().div_ceil(divisor)
}

fn role_priority(role: MessageRole) -> u8 {
    match role {
        MessageRole::System => 3,
        MessageRole::Assistant | MessageRole::Action => 2,
        MessageRole::User => 1,
        MessageRole::Tool => 0,
    }
}

/// Bounds for a single window request; unset fields fall back to the
/// buffer's configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowOptions {
    pub max_tokens: Option<usize>,
    pub max_messages: Option<usize>,
}

/// Buffer usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageStats {
    pub message_count: usize,
    pub total_tokens: usize,
    pub max_messages: usize,
    pub max_tokens: usize,
}

/// Bounded, anchor-aware message window.
pub struct ContextBuffer {
    config: ContextConfig,
    messages: RwLock<Vec<Message>>,
}

impl ContextBuffer {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            messages: RwLock::new(Vec::new()),
        }
    }

    /// Append one message and apply the trim policy.
    pub fn add_message(&self, message: Message) {
        let mut messages = self.messages.write();
        messages.push(message);
        Self::trim(&self.config, &mut messages);
    }

    /// Replace the buffer contents and apply the trim policy.
    pub fn set_messages(&self, new_messages: Vec<Message>) {
        let mut messages = self.messages.write();
        *messages = new_messages;
        Self::trim(&self.config, &mut messages);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.messages.write().clear();
    }

    /// Current buffer length.
    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    /// Select a temporally ordered sub-sequence within the given bounds.
    ///
    /// The first stored message, when it is a system message, is pinned: it
    /// is always part of the window and its tokens count against the
    /// budget. Remaining slots are filled by anchors first, then recency.
    pub fn get_window(&self, options: WindowOptions) -> Vec<Message> {
        let messages = self.messages.read();
        let max_tokens = options.max_tokens.unwrap_or(self.config.max_tokens);
        let max_messages = options.max_messages.unwrap_or(self.config.max_messages);

        if messages.is_empty() || max_messages == 0 {
            return Vec::new();
        }

        let pinned = matches!(messages[0].role, MessageRole::System);
        let mut token_budget_used = if pinned {
            estimate_tokens(&messages[0].content)
        } else {
            0
        };
        let slot_budget = max_messages.saturating_sub(usize::from(pinned));

        // Candidates carry their original index so the final window can be
        // rebuilt in temporal order.
        let start = usize::from(pinned);
        let mut candidates: Vec<(bool, usize)> = messages[start..]
            .iter()
            .enumerate()
            .map(|(offset, m)| (m.is_anchor(), start + offset))
            .collect();
        // Anchors first, then most recent first.
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        let mut selected: Vec<usize> = Vec::new();
        for (_, index) in candidates {
            if selected.len() >= slot_budget {
                break;
            }
            let cost = estimate_tokens(&messages[index].content);
            if token_budget_used + cost > max_tokens {
                continue;
            }
            token_budget_used += cost;
            selected.push(index);
        }
        selected.sort_unstable();

        let mut window = Vec::with_capacity(selected.len() + usize::from(pinned));
        if pinned {
            window.push(messages[0].clone());
        }
        window.extend(selected.into_iter().map(|i| messages[i].clone()));
        window
    }

    /// Prompt-ready rendering of the window: one `[ROLE]: content` line per
    /// message.
    pub fn to_prompt_string(&self, limit: Option<usize>) -> String {
        let window = self.get_window(WindowOptions {
            max_messages: limit,
            ..WindowOptions::default()
        });
        window
            .iter()
            .map(|m| format!("[{}]: {}", m.role.as_str().to_uppercase(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether the estimated token total exceeds `threshold`
    /// (default `0.8 × max_tokens`).
    pub fn should_summarize(&self, threshold: Option<usize>) -> bool {
        let threshold =
            threshold.unwrap_or_else(|| (self.config.max_tokens as f64 * 0.8) as usize);
        self.total_tokens() > threshold
    }

    /// Message count, token total, and configured limits.
    pub fn get_usage_stats(&self) -> UsageStats {
        let messages = self.messages.read();
        UsageStats {
            message_count: messages.len(),
            total_tokens: messages.iter().map(|m| estimate_tokens(&m.content)).sum(),
            max_messages: self.config.max_messages,
            max_tokens: self.config.max_tokens,
        }
    }

    fn total_tokens(&self) -> usize {
        self.messages
            .read()
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum()
    }

    /// Importance trimming, invoked once the buffer exceeds 1.5× its
    /// message cap: keep the pinned system message plus the top
    /// `max_messages` survivors under `(anchor desc, role priority desc)`,
    /// preserving temporal order.
    fn trim(config: &ContextConfig, messages: &mut Vec<Message>) {
        if messages.len() <= config.max_messages + config.max_messages / 2 {
            return;
        }

        let pinned = matches!(messages.first().map(|m| m.role), Some(MessageRole::System));
        let start = usize::from(pinned);

        let mut ranked: Vec<(bool, u8, usize)> = messages[start..]
            .iter()
            .enumerate()
            .map(|(offset, m)| (m.is_anchor(), role_priority(m.role), start + offset))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));
        ranked.truncate(config.max_messages);

        let mut keep: Vec<usize> = ranked.into_iter().map(|(_, _, index)| index).collect();
        keep.sort_unstable();

        let mut rebuilt = Vec::with_capacity(keep.len() + usize::from(pinned));
        if pinned {
            rebuilt.push(messages[0].clone());
        }
        rebuilt.extend(keep.into_iter().map(|i| messages[i].clone()));
        *messages = rebuilt;
    }
}
