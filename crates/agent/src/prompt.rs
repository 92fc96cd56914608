use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde_json::Value;
use thiserror::Error;

use frontdesk_core::domain::action::{ActionCategory, ActionDefinition};
use frontdesk_core::domain::envelope::ConversationTurn;

pub const DEFAULT_HISTORY_TURNS: usize = 10;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("message context could not be rendered: {0}")]
    Context(#[from] serde_json::Error),
    #[error("prompt formatting failed")]
    Format(#[from] std::fmt::Error),
}

/// Everything the decision prompt is rendered from.
pub struct PromptInput<'a> {
    pub tenant_id: &'a str,
    pub business_type: Option<&'a str>,
    pub message: &'a str,
    pub context: &'a Value,
    pub history: &'a [ConversationTurn],
    pub actions: &'a [&'a ActionDefinition],
}

#[derive(Clone, Debug)]
pub struct PromptBuilder {
    history_turns: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self { history_turns: DEFAULT_HISTORY_TURNS }
    }
}

impl PromptBuilder {
    pub fn new(history_turns: usize) -> Self {
        Self { history_turns }
    }

    pub fn history_turns(&self) -> usize {
        self.history_turns
    }

    pub fn build(&self, input: &PromptInput<'_>) -> Result<String, PromptError> {
        let mut prompt = String::new();

        writeln!(
            prompt,
            "You are the front-desk assistant for tenant `{}`{}.",
            input.tenant_id,
            input.business_type.map(|kind| format!(" (a {kind} business)")).unwrap_or_default()
        )?;
        writeln!(
            prompt,
            "Decide which of the permitted actions, if any, should be taken for the latest message."
        )?;
        writeln!(prompt)?;

        writeln!(prompt, "## Permitted actions")?;
        if input.actions.is_empty() {
            writeln!(prompt, "(none; answer without proposing actions)")?;
        }
        for (category, definitions) in group_by_category(input.actions) {
            writeln!(prompt, "### {}", category.as_str())?;
            for definition in definitions {
                writeln!(
                    prompt,
                    "- {} (cost {} tokens, level {}): {}",
                    definition.action_type,
                    definition.token_cost,
                    definition.default_level.as_str(),
                    definition.description
                )?;
                for spec in &definition.parameters {
                    writeln!(
                        prompt,
                        "    - {}: {}{}",
                        spec.name,
                        spec.kind.as_str(),
                        if spec.required { ", required" } else { "" }
                    )?;
                }
            }
        }
        writeln!(prompt)?;

        let recent = recent_turns(input.history, self.history_turns);
        if !recent.is_empty() {
            writeln!(prompt, "## Conversation so far")?;
            for turn in recent {
                writeln!(prompt, "{}: {}", turn.role, turn.content)?;
            }
            writeln!(prompt)?;
        }

        if !input.context.is_null() {
            writeln!(prompt, "## Context")?;
            writeln!(prompt, "{}", serde_json::to_string_pretty(input.context)?)?;
            writeln!(prompt)?;
        }

        writeln!(prompt, "## Latest message")?;
        writeln!(prompt, "{}", input.message)?;
        writeln!(prompt)?;

        writeln!(prompt, "## Response format")?;
        writeln!(
            prompt,
            "Reply with a single JSON object and nothing else: \
             {{\"actions\": [{{\"type\": string, \"parameters\": object, \"priority\": \
             \"low|medium|high|urgent\"}}], \"reasoning\": string, \"confidence\": 0-100}}"
        )?;

        Ok(prompt)
    }
}

fn group_by_category<'a>(
    actions: &[&'a ActionDefinition],
) -> BTreeMap<ActionCategory, Vec<&'a ActionDefinition>> {
    let mut grouped: BTreeMap<ActionCategory, Vec<&ActionDefinition>> = BTreeMap::new();
    for definition in actions {
        grouped.entry(definition.category).or_default().push(definition);
    }
    grouped
}

fn recent_turns(history: &[ConversationTurn], limit: usize) -> &[ConversationTurn] {
    &history[history.len().saturating_sub(limit)..]
}
