//! Schema validation for oracle responses
//!
//! Validation is all-or-nothing: a response failing any rule is rejected
//! wholesale. Accepting the valid half of a malformed response would let a
//! partially-applied chapter corrupt the accumulation invariant.

use super::types::{ChapterAnalysis, OracleError, OracleResult};
use crate::market::resolver::ResolvedMention;

/// Check a parsed analysis against the chapter's resolved mention list
///
/// Rules, each fatal to the whole response:
/// - every verdict must name a character from the mention list (a delta for
///   an unmentioned character is treated as a schema violation, not
///   silently accepted);
/// - at most one verdict per character;
/// - deltas and confidences must be finite, confidences within [0, 1];
/// - a first-appearance character must carry a finite, non-negative
///   `initial_value` and must have a verdict at all;
/// - an already-tracked character must not carry `initial_value` (initial
///   values are write-once; re-supplying one implies identity mutation).
pub fn validate_analysis(
    analysis: &ChapterAnalysis,
    mentions: &[ResolvedMention],
) -> OracleResult<()> {
    let reject = |reason: String| -> OracleError {
        OracleError::Schema {
            reason,
            payload: serde_json::to_string(analysis)
                .unwrap_or_else(|_| "<unserializable analysis>".to_string()),
        }
    };

    let mut seen: Vec<&str> = Vec::with_capacity(analysis.verdicts.len());
    for verdict in &analysis.verdicts {
        let mention = mentions
            .iter()
            .find(|m| m.reference.as_str() == verdict.reference)
            .ok_or_else(|| {
                reject(format!(
                    "verdict for '{}' which is not in the chapter's mention list",
                    verdict.reference
                ))
            })?;

        if seen.contains(&verdict.reference.as_str()) {
            return Err(reject(format!(
                "duplicate verdict for '{}'",
                verdict.reference
            )));
        }
        seen.push(&verdict.reference);

        match (mention.is_new(), verdict.initial_value) {
            (true, None) => {
                return Err(reject(format!(
                    "first appearance of '{}' lacks an initial value",
                    verdict.reference
                )));
            }
            (true, Some(initial)) if !initial.is_finite() || initial < 0.0 => {
                return Err(reject(format!(
                    "initial value {initial} for '{}' is not a finite non-negative number",
                    verdict.reference
                )));
            }
            (false, Some(_)) => {
                return Err(reject(format!(
                    "initial value supplied for already-tracked '{}'",
                    verdict.reference
                )));
            }
            _ => {}
        }

        for (index, action) in verdict.actions.iter().enumerate() {
            if !action.delta.is_finite() {
                return Err(reject(format!(
                    "action {index} for '{}' has non-finite delta {}",
                    verdict.reference, action.delta
                )));
            }
            if !action.confidence.is_finite()
                || !(0.0..=1.0).contains(&action.confidence)
            {
                return Err(reject(format!(
                    "action {index} for '{}' has confidence {} outside [0, 1]",
                    verdict.reference, action.confidence
                )));
            }
        }
    }

    // Every first appearance needs a verdict: without one there is no
    // initial value to create the character from.
    for mention in mentions {
        if mention.is_new() && analysis.verdict_for(mention.reference.as_str()).is_none() {
            return Err(reject(format!(
                "no verdict establishing an initial value for new character '{}'",
                mention.reference
            )));
        }
    }

    Ok(())
}
