use serde::{Deserialize, Serialize};

use relay_core::config::{DelegationMode, RouterConfig};

use crate::classifier::IntentClassification;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub should_delegate: bool,
    pub delegation_type: DelegationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_prompt: Option<String>,
}

impl RoutingDecision {
    pub fn no_op() -> Self {
        Self::default()
    }
}

/// Map a classification to a delegation decision by static table lookup.
/// Prompt templates support `{input}` parameter substitution only; no code
/// runs here and no I/O happens.
pub fn route(
    classification: &IntentClassification,
    input: &str,
    router: &RouterConfig,
) -> RoutingDecision {
    if !classification.should_orchestrate {
        return RoutingDecision::no_op();
    }

    let Some(intent) = router.intents.get(&classification.intent) else {
        return RoutingDecision::no_op();
    };
    if intent.mode == DelegationMode::None {
        return RoutingDecision::no_op();
    }

    let prompt = fill_template(&intent.template, input);
    RoutingDecision {
        should_delegate: true,
        delegation_type: intent.mode,
        primary_agent: intent.primary.clone(),
        background_agent: intent.background.clone(),
        primary_prompt: Some(prompt.clone()),
        background_prompt: intent.background.is_some().then_some(prompt),
    }
}

fn fill_template(template: &str, input: &str) -> String {
    if template.is_empty() {
        return input.to_string();
    }
    template.replace("{input}", input)
}
