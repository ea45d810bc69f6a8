//! Per-flow traffic generation: request/response block sizes and the
//! inter-packet gap (§4.3).

use crate::block::MIN_BLOCK_SIZE;
use crate::flow::TrafgenOptions;
use crate::math::FlowRng;

/// Draws are retried this many times before a distribution that keeps
/// landing out of bounds is simply clamped (`trafgen.c`'s
/// `MAX_RUNS_PER_DISTRIBUTION`).
const MAX_RUNS_PER_DISTRIBUTION: u32 = 10;

fn draw(rng: &mut FlowRng, opts: &TrafgenOptions) -> i32 {
    rng.sample(opts.distribution, opts.param_one, opts.param_two).round() as i32
}

/// Next request block size, always in `[MIN_BLOCK_SIZE, maximum_block_size]`.
///
/// Retries the draw up to [`MAX_RUNS_PER_DISTRIBUTION`] times; if it still
/// lies outside the bound, clamps to whichever side it missed.
pub fn next_request_size(rng: &mut FlowRng, opts: &TrafgenOptions, maximum_block_size: i32) -> i32 {
    let mut bs = 0;
    let mut i = 0;
    while (bs < MIN_BLOCK_SIZE || bs > maximum_block_size) && i < MAX_RUNS_PER_DISTRIBUTION {
        bs = draw(rng, opts);
        i += 1;
    }

    if i >= MAX_RUNS_PER_DISTRIBUTION && bs < MIN_BLOCK_SIZE {
        log::warn!("applied minimal request size limit {}", MIN_BLOCK_SIZE);
        bs = MIN_BLOCK_SIZE;
    }
    if i >= MAX_RUNS_PER_DISTRIBUTION && bs > maximum_block_size {
        log::warn!("applied maximal request size limit {}", maximum_block_size);
        bs = maximum_block_size;
    }
    bs
}

/// Next response block size, in `{0} ∪ [MIN_BLOCK_SIZE, maximum_block_size]`.
/// Unlike the request size, there is no retry: a bad draw is clamped directly.
pub fn next_response_size(rng: &mut FlowRng, opts: &TrafgenOptions, maximum_block_size: i32) -> i32 {
    let mut bs = draw(rng, opts);

    if bs != 0 && bs < MIN_BLOCK_SIZE {
        log::warn!("applied minimal response size limit {}", MIN_BLOCK_SIZE);
        bs = MIN_BLOCK_SIZE;
    }
    if bs > maximum_block_size {
        log::warn!("applied maximal response size limit {}", maximum_block_size);
        bs = maximum_block_size;
    }
    bs
}

/// Next inter-packet gap in seconds. A configured write-rate ceiling bypasses
/// the stochastic model entirely.
pub fn next_interpacket_gap(
    rng: &mut FlowRng,
    opts: &TrafgenOptions,
    maximum_block_size: i32,
    write_rate: Option<u32>,
) -> f64 {
    match write_rate {
        Some(rate) if rate > 0 => maximum_block_size as f64 / rate as f64,
        _ => rng.sample(opts.distribution, opts.param_one, opts.param_two).max(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Distribution;

    fn opts(distribution: Distribution, param_one: f64, param_two: f64) -> TrafgenOptions {
        TrafgenOptions { distribution, param_one, param_two }
    }

    #[test]
    fn request_size_stays_in_bounds_for_wild_normal() {
        let mut rng = FlowRng::new(1);
        let o = opts(Distribution::Normal, 0.0, 1_000_000.0);
        for _ in 0..100 {
            let bs = next_request_size(&mut rng, &o, 1500);
            assert!(bs >= MIN_BLOCK_SIZE && bs <= 1500, "out of bounds: {}", bs);
        }
    }

    #[test]
    fn response_size_zero_passes_through_unclamped() {
        let mut rng = FlowRng::new(2);
        let o = opts(Distribution::Constant, 0.0, 0.0);
        assert_eq!(next_response_size(&mut rng, &o, 1500), 0);
    }

    #[test]
    fn response_size_clamps_to_maximum() {
        let mut rng = FlowRng::new(3);
        let o = opts(Distribution::Constant, 99999.0, 0.0);
        assert_eq!(next_response_size(&mut rng, &o, 1500), 1500);
    }

    #[test]
    fn interpacket_gap_bypasses_distribution_when_rate_capped() {
        let mut rng = FlowRng::new(4);
        let o = opts(Distribution::Exponential, 10.0, 0.0);
        let gap = next_interpacket_gap(&mut rng, &o, 1460, Some(1000));
        assert!((gap - 1.46).abs() < 1e-9);
    }

    #[test]
    fn interpacket_gap_never_negative() {
        let mut rng = FlowRng::new(5);
        let o = opts(Distribution::Normal, -1000.0, 1.0);
        for _ in 0..100 {
            assert!(next_interpacket_gap(&mut rng, &o, 1460, None) >= 0.0);
        }
    }
}
