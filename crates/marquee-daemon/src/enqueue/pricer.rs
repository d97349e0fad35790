//! Request cost computation.
//!
//! Deterministic in the entry's play time and the configured pricing
//! parameters.

use std::time::Duration;

use marquee_core::amount::Amount;
use marquee_core::config::EnqueueConfig;

/// Live broadcasts are priced as if they were this long.
const LIVE_PRICED_MINUTES: u64 = 10;

/// Price for enqueuing media of the given length, starting at `offset`.
pub fn compute_enqueue_price(
    config: &EnqueueConfig,
    length: Option<Duration>,
    offset: Duration,
) -> Amount {
    let minutes = match length {
        Some(length) => length.saturating_sub(offset).as_secs().div_ceil(60),
        None => LIVE_PRICED_MINUTES,
    };
    let centi = config.base_price_centi + config.price_per_minute_centi * minutes;
    Amount::CENTI.saturating_mul(u128::from(centi))
}
