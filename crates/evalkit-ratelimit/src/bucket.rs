use tokio::time::Instant;

/// Token bucket that refills to full capacity once per 60s window, rather
/// than continuously — matching the "refills by `requestsPerMinute` every
/// 60s in one step" rule in §4.2.
pub struct TokenBucket {
    capacity: u32,
    tokens: u32,
    window_start: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            window_start: now,
        }
    }

    fn refill_if_needed(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= std::time::Duration::from_secs(60) {
            self.tokens = self.capacity;
            self.window_start = now;
        }
    }

    /// Attempts to take one token, refilling the window first if it has
    /// elapsed. Returns `true` if a token was available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill_if_needed(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// How long until the next window reset, from `now`.
    pub fn time_until_refill(&self, now: Instant) -> std::time::Duration {
        let elapsed = now.duration_since(self.window_start);
        let window = std::time::Duration::from_secs(60);
        window.saturating_sub(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_exhausts_then_refills() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, start);
        assert!(bucket.try_take(start));
        assert!(bucket.try_take(start));
        assert!(!bucket.try_take(start));

        let later = start + std::time::Duration::from_secs(61);
        assert!(bucket.try_take(later));
    }
}
