//! Difficulty retargeting
//!
//! Two integer-only algorithms, selected by block major version:
//! the classic CryptoNote windowed average (versions 1 and 2) and
//! LWMA-3 (version 3 onwards). Both take the timestamps and cumulative
//! difficulties of the most recent blocks, oldest first.

/// Parameters of the LWMA-3 estimator
#[derive(Debug, Clone, Copy)]
pub struct LwmaParams {
    /// Target solve time in seconds
    pub target: u64,
    /// Number of solve times averaged (uses `window + 1` blocks)
    pub window: usize,
    pub minimum_difficulty: u64,
}

/// Parameters of the classic CryptoNote estimator
#[derive(Debug, Clone, Copy)]
pub struct LegacyParams {
    pub target: u64,
    pub window: usize,
    /// Outliers dropped from each end of the sorted window
    pub cut: usize,
    pub minimum_difficulty: u64,
}

/// Solve times above this multiple of the target are clamped
const LWMA_MAX_SOLVETIME_FACTOR: u64 = 6;

/// Linearly weighted moving average, version 3
///
/// Fewer than four samples returns the minimum difficulty. With fewer than
/// `window + 1` samples every available solve time is used. The result never
/// leaves `[prev * 0.67, prev * 1.5]` before the minimum is applied.
pub fn next_difficulty_lwma3(
    params: &LwmaParams,
    timestamps: &[u64],
    cumulative_difficulties: &[u128],
) -> u64 {
    let len = timestamps.len().min(cumulative_difficulties.len());
    if len < 4 {
        return params.minimum_difficulty;
    }

    let n = params.window.min(len - 1);
    let timestamps = &timestamps[len - n - 1..len];
    let cumulative = &cumulative_difficulties[len - n - 1..len];

    let target = params.target as u128;
    let mut previous_timestamp = timestamps[0];
    let mut weighted_solvetimes: u128 = 0;
    let mut sum_last_three: u128 = 0;

    for i in 1..=n {
        let this_timestamp = if timestamps[i] > previous_timestamp {
            timestamps[i]
        } else {
            previous_timestamp + 1
        };
        let solvetime = (this_timestamp - previous_timestamp)
            .min(LWMA_MAX_SOLVETIME_FACTOR * params.target) as u128;
        previous_timestamp = this_timestamp;

        weighted_solvetimes += solvetime * i as u128;
        if i + 3 > n {
            sum_last_three += solvetime;
        }
    }

    let n128 = n as u128;
    let work = cumulative[n].saturating_sub(cumulative[0]);
    let mut next = work * target * (n128 + 1) * 99 / (100 * 2 * weighted_solvetimes);

    let previous = cumulative[n].saturating_sub(cumulative[n - 1]);
    next = next.min(previous * 150 / 100).max(previous * 67 / 100);
    if sum_last_three < 8 * target / 10 {
        next = next.max(previous * 108 / 100);
    }

    clamp_to_u64(next).max(params.minimum_difficulty)
}

/// Classic CryptoNote difficulty
///
/// Only the oldest `window` samples are used, so callers pass
/// `window + lag` blocks to skip the most recent `lag`.
pub fn next_difficulty_legacy(
    params: &LegacyParams,
    timestamps: &[u64],
    cumulative_difficulties: &[u128],
) -> u64 {
    let len = timestamps
        .len()
        .min(cumulative_difficulties.len())
        .min(params.window);
    if len <= 1 {
        return params.minimum_difficulty;
    }

    let mut sorted = timestamps[..len].to_vec();
    sorted.sort_unstable();

    let kept = params.window - 2 * params.cut;
    let (cut_begin, cut_end) = if len <= kept {
        (0, len)
    } else {
        let begin = (len - kept + 1) / 2;
        (begin, begin + kept)
    };

    let time_span = (sorted[cut_end - 1] - sorted[cut_begin]).max(1) as u128;
    let total_work =
        cumulative_difficulties[cut_end - 1].saturating_sub(cumulative_difficulties[cut_begin]);

    let next = (total_work * params.target as u128 + time_span - 1) / time_span;
    clamp_to_u64(next).max(params.minimum_difficulty)
}

fn clamp_to_u64(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LWMA: LwmaParams = LwmaParams {
        target: 120,
        window: 60,
        minimum_difficulty: 1,
    };

    fn steady_chain(blocks: usize, difficulty: u64, solvetime: u64) -> (Vec<u64>, Vec<u128>) {
        let timestamps = (0..blocks as u64).map(|i| 1_000 + i * solvetime).collect();
        let cumulative = (1..=blocks as u128).map(|i| i * difficulty as u128).collect();
        (timestamps, cumulative)
    }

    #[test]
    fn test_bootstrap_returns_minimum() {
        let (ts, cd) = steady_chain(3, 1_000, 120);
        assert_eq!(next_difficulty_lwma3(&LWMA, &ts, &cd), 1);
    }

    #[test]
    fn test_on_target_chain_is_nearly_stable() {
        let (ts, cd) = steady_chain(61, 100_000, 120);
        let next = next_difficulty_lwma3(&LWMA, &ts, &cd);
        // LWMA-3 carries a 1% downward bias
        assert_eq!(next, 99_000);
    }

    #[test]
    fn test_fast_blocks_raise_difficulty_within_clamp() {
        let (ts, cd) = steady_chain(61, 100_000, 10);
        let next = next_difficulty_lwma3(&LWMA, &ts, &cd);
        assert_eq!(next, 150_000);
    }

    #[test]
    fn test_slow_blocks_lower_difficulty_within_clamp() {
        let (ts, cd) = steady_chain(61, 100_000, 10_000);
        let next = next_difficulty_lwma3(&LWMA, &ts, &cd);
        assert_eq!(next, 67_000);
    }

    #[test]
    fn test_non_monotonic_timestamps_do_not_panic() {
        let (mut ts, cd) = steady_chain(61, 5_000, 120);
        ts.reverse();
        let next = next_difficulty_lwma3(&LWMA, &ts, &cd);
        assert!(next >= 5_000 * 67 / 100 && next <= 5_000 * 150 / 100);
    }

    #[test]
    fn test_legacy_matches_work_over_time() {
        let params = LegacyParams {
            target: 120,
            window: 720,
            cut: 60,
            minimum_difficulty: 1,
        };
        let (ts, cd) = steady_chain(100, 2_000, 120);
        // 99 solve times of 120s carrying 99 * 2000 work
        assert_eq!(next_difficulty_legacy(&params, &ts, &cd), 2_000);
        assert_eq!(next_difficulty_legacy(&params, &ts[..1], &cd[..1]), 1);
    }
}
