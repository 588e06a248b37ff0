use rand::{Rng, RngCore};
use std::time::Duration;

/// Upper bound on any single submission backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Exponential backoff before submission attempt `attempt + 1` (attempts are 1-based).
pub(crate) fn submission_backoff(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}

pub(crate) fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }

    // "Equal jitter": delay is in [backoff/2, backoff].
    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn submission_backoff_doubles_and_caps() {
        let base = Duration::from_millis(200);
        assert_eq!(submission_backoff(base, 1), Duration::from_millis(200));
        assert_eq!(submission_backoff(base, 2), Duration::from_millis(400));
        assert_eq!(submission_backoff(base, 3), Duration::from_millis(800));
        assert_eq!(submission_backoff(base, 40), MAX_BACKOFF);
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let mut rng = StdRng::seed_from_u64(7);
        let backoff = Duration::from_millis(1_000);
        for _ in 0..100 {
            let delay = jittered_backoff(&mut rng, backoff);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= backoff);
        }
        assert_eq!(jittered_backoff(&mut rng, Duration::ZERO), Duration::ZERO);
    }
}
