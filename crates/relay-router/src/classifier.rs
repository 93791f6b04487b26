use std::time::Instant;

use serde::{Deserialize, Serialize};

use relay_core::config::{OrchestrationConfig, RouterConfig};

pub const GENERAL_INTENT: &str = "general";

/// Soft latency budget; overruns are logged, never fatal.
const CLASSIFY_BUDGET_MS: u128 = 10;

const BASE_SCORE: f64 = 0.65;
const BONUS_PER_EXTRA_KEYWORD: f64 = 0.10;
const LENGTH_BONUS_CAP: f64 = 0.10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent: String,
    pub confidence: f64,
    pub matched_keywords: Vec<String>,
    pub should_orchestrate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_agent: Option<String>,
}

impl IntentClassification {
    fn bypass() -> Self {
        Self {
            intent: GENERAL_INTENT.to_string(),
            confidence: 1.0,
            matched_keywords: Vec::new(),
            should_orchestrate: false,
            primary_agent: None,
            background_agent: None,
        }
    }

    fn general() -> Self {
        Self {
            intent: GENERAL_INTENT.to_string(),
            confidence: 0.0,
            matched_keywords: Vec::new(),
            should_orchestrate: false,
            primary_agent: None,
            background_agent: None,
        }
    }
}

/// Keyword-weight scoring over the configured intents. Slash-commands and
/// the literal `directly:` prefix bypass orchestration entirely.
pub fn classify(
    input: &str,
    router: &RouterConfig,
    orchestration: &OrchestrationConfig,
) -> IntentClassification {
    let started = Instant::now();

    if input.starts_with('/') || starts_with_ignore_case(input, "directly:") {
        return IntentClassification::bypass();
    }

    let haystack = input.to_lowercase();
    let mut best: Option<(String, f64, Vec<String>)> = None;

    // BTreeMap iteration fixes the tie-break order across restarts.
    for (name, intent) in &router.intents {
        let matched: Vec<String> = intent
            .keywords
            .iter()
            .filter(|keyword| haystack.contains(&keyword.to_lowercase()))
            .cloned()
            .collect();
        if matched.is_empty() {
            continue;
        }

        let extra_matches = (matched.len() - 1) as f64;
        let avg_keyword_length =
            matched.iter().map(|k| k.len()).sum::<usize>() as f64 / matched.len() as f64;
        let length_bonus = (avg_keyword_length / 50.0).min(LENGTH_BONUS_CAP);
        let score =
            (BASE_SCORE + extra_matches * BONUS_PER_EXTRA_KEYWORD + length_bonus).min(1.0);

        // Strict comparison keeps the first intent on ties.
        if best
            .as_ref()
            .map_or(true, |(_, best_score, _)| score > *best_score)
        {
            best = Some((name.clone(), score, matched));
        }
    }

    let elapsed = started.elapsed().as_millis();
    if elapsed > CLASSIFY_BUDGET_MS {
        log::warn!(
            "intent classification took {elapsed}ms over {} bytes of input",
            input.len()
        );
    }

    let Some((intent, confidence, matched_keywords)) = best else {
        return IntentClassification::general();
    };

    let should_orchestrate =
        orchestration.enabled && confidence >= orchestration.confidence_threshold;
    let intent_config = router.intents.get(&intent);

    IntentClassification {
        primary_agent: should_orchestrate
            .then(|| intent_config.and_then(|c| c.primary.clone()))
            .flatten(),
        background_agent: should_orchestrate
            .then(|| intent_config.and_then(|c| c.background.clone()))
            .flatten(),
        intent,
        confidence,
        matched_keywords,
        should_orchestrate,
    }
}

fn starts_with_ignore_case(input: &str, prefix: &str) -> bool {
    input
        .get(..prefix.len())
        .map_or(false, |head| head.eq_ignore_ascii_case(prefix))
}
