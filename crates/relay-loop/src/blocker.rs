use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use relay_core::run::{BlockerInfo, BlockerReason};

static BLOCKER_PATTERNS: Lazy<Vec<(BlockerReason, Regex)>> = Lazy::new(|| {
    vec![
        (
            BlockerReason::InsufficientFunds,
            Regex::new(r"(?i)insufficient (funds|balance)|not enough (funds|balance|gas)")
                .expect("static regex"),
        ),
        (
            BlockerReason::RateLimit,
            Regex::new(r"(?i)rate.?limit(ed)?|too many requests|\b429\b").expect("static regex"),
        ),
        (
            BlockerReason::ApiKeyError,
            Regex::new(r"(?i)(invalid|expired|missing|bad) api.?key|api.?key (is )?(invalid|expired|missing)")
                .expect("static regex"),
        ),
        (
            BlockerReason::PermissionDenied,
            Regex::new(r"(?i)permission denied|not authorized|access denied|forbidden")
                .expect("static regex"),
        ),
        (
            BlockerReason::ConnectionError,
            Regex::new(r"(?i)connection (refused|reset|closed|failed|error)|network (error|unreachable)|ECONNREFUSED")
                .expect("static regex"),
        ),
    ]
});

static AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*([A-Z]{2,6}|credits?|tokens?)").expect("static regex")
});

/// Scans assistant text for conditions that require operator attention.
/// The first matching reason wins; all matching pattern snippets are kept
/// for the report.
#[derive(Debug, Default)]
pub struct BlockerDetector;

impl BlockerDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, text: &str) -> Option<BlockerInfo> {
        let mut reason = None;
        let mut matched_patterns = Vec::new();

        for (candidate, pattern) in BLOCKER_PATTERNS.iter() {
            if let Some(found) = pattern.find(text) {
                if reason.is_none() {
                    reason = Some(*candidate);
                }
                matched_patterns.push(found.as_str().to_string());
            }
        }

        let reason = reason?;
        let extracted_context = match reason {
            BlockerReason::InsufficientFunds => extract_amount(text),
            _ => None,
        };

        Some(BlockerInfo {
            reason,
            matched_patterns,
            extracted_context,
        })
    }
}

fn extract_amount(text: &str) -> Option<serde_json::Value> {
    let captures = AMOUNT.captures(text)?;
    let current: f64 = captures.get(1)?.as_str().parse().ok()?;
    let unit = captures.get(2).map(|m| m.as_str().to_string());
    Some(match unit {
        Some(unit) => json!({ "current": current, "unit": unit }),
        None => json!({ "current": current }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_insufficient_funds_with_balance() {
        let detector = BlockerDetector::new();
        let info = detector
            .detect("Transaction failed: insufficient funds 0.02 SOL remaining")
            .expect("blocker detected");
        assert_eq!(info.reason, BlockerReason::InsufficientFunds);
        let context = info.extracted_context.unwrap();
        assert_eq!(context["current"], 0.02);
        assert_eq!(context["unit"], "SOL");
    }

    #[test]
    fn detects_rate_limit_variants() {
        let detector = BlockerDetector::new();
        for text in [
            "The API returned 429",
            "we are being rate limited",
            "Too many requests, slow down",
        ] {
            let info = detector.detect(text).expect("blocker detected");
            assert_eq!(info.reason, BlockerReason::RateLimit, "text {text:?}");
        }
    }

    #[test]
    fn detects_api_key_and_permission_and_connection() {
        let detector = BlockerDetector::new();
        assert_eq!(
            detector.detect("the request failed: invalid API key").unwrap().reason,
            BlockerReason::ApiKeyError
        );
        assert_eq!(
            detector.detect("Permission denied for that folder").unwrap().reason,
            BlockerReason::PermissionDenied
        );
        assert_eq!(
            detector.detect("connection refused by upstream").unwrap().reason,
            BlockerReason::ConnectionError
        );
    }

    #[test]
    fn first_reason_wins_but_all_matches_are_reported() {
        let detector = BlockerDetector::new();
        let info = detector
            .detect("insufficient funds after hitting a rate limit")
            .unwrap();
        assert_eq!(info.reason, BlockerReason::InsufficientFunds);
        assert_eq!(info.matched_patterns.len(), 2);
    }

    #[test]
    fn plain_text_is_not_a_blocker() {
        let detector = BlockerDetector::new();
        assert!(detector.detect("All tests passed, deploying now.").is_none());
        assert!(detector.detect("").is_none());
    }
}
