/// Deterministic token estimation for admission control.
///
/// Estimates are intentionally simple: roughly one token per four
/// characters of serialized input, plus a fixed per-call overhead. The
/// function is monotonic in input length so estimates are stable and
/// testable; actual consumption is reported by the adapter afterwards.
const CHARS_PER_TOKEN: u64 = 4;
const PER_CALL_OVERHEAD: u64 = 8;

/// Estimate tokens for a free-text input.
pub fn estimate_text_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    PER_CALL_OVERHEAD + chars.div_ceil(CHARS_PER_TOKEN)
}

/// Estimate tokens for a structured tool parameter object.
/// Uses the compact JSON serialization as the measured text.
pub fn estimate_param_tokens(parameters: &serde_json::Value) -> u64 {
    let serialized = serde_json::to_string(parameters).unwrap_or_default();
    estimate_text_tokens(&serialized)
}
