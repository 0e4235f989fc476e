//! Retryability classification (§4.4, §7, §9): a pure function on an error
//! message. Faithful to the source's string-matching approach even though
//! it is brittle — §9 asks for the function and its test vectors to
//! survive, plus an additional path that trusts a structured `retryable`
//! flag when the producer supplies one.

const RETRYABLE_KEYWORDS: &[&str] = &[
    "econnreset",
    "etimedout",
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "fetch failed",
    "network error",
    "429",
    "rate limit",
    "rate-limit",
    "too many requests",
];

const NON_RETRYABLE_KEYWORDS: &[&str] = &[
    "validation",
    "400",
    "bad request",
    "401",
    "unauthorized",
    "403",
    "forbidden",
    "404",
    "not found",
];

/// Classifies an error message as retryable or not. Network issues,
/// `429`s, and `5xx`s are retryable; validation and `4xx` auth/not-found
/// errors are not; anything unrecognized defaults to retryable so a
/// transient-but-unfamiliar failure doesn't get recorded as permanent.
pub fn is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();

    if NON_RETRYABLE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return false;
    }
    if RETRYABLE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return true;
    }
    if is_5xx(&lower) {
        return true;
    }
    // Unknown error shape: default to retryable (§4.4).
    true
}

fn is_5xx(lower: &str) -> bool {
    ["500", "502", "503", "504"].iter().any(|code| lower.contains(code))
}

/// Prefers a structured `retryable` flag from the producer's JSON contract
/// when present (§9), falling back to string classification otherwise.
pub fn is_retryable_structured(message: &str, structured_flag: Option<bool>) -> bool {
    structured_flag.unwrap_or_else(|| is_retryable(message))
}
