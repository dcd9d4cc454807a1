//! Liveness monitor that forces a reconnect when upstream goes silent, and
//! fills the gap with neutral samples while it waits (§4.6).
//!
//! Ported tick-for-tick from `watchdog_thread` in
//! `examples/original_source/rtl_mus.py`, including its exact constants:
//! a 4-second startup delay, 10 fill sub-intervals per second, and
//! `0x7F` as the IQ-midpoint filler byte. The original's `zero_buffer_size`
//! was 16348, one short of the 16384-byte chunking used everywhere else in
//! that file; this spec corrects it, so the fill buffer here matches
//! [`crate::upstream::UPSTREAM_READ_CHUNK`].

use std::sync::Arc;
use std::time::Duration;

use crate::engine::{Chunk, Engine};

const STARTUP_DELAY: Duration = Duration::from_secs(4);
const FILL_BUFFER_SIZE: usize = 16_384;
const FILL_SUB_INTERVALS_PER_SEC: u64 = 10;
const FILL_BYTE: u8 = 0x7F;

/// Runs forever; callers should only spawn this when `watchdog_interval`
/// is non-zero (§3: "0 disables").
pub async fn run(engine: Arc<Engine>) {
    tokio::time::sleep(STARTUP_DELAY).await;
    tracing::info!("watchdog started");

    let mut first_tick = true;
    let mut starved_last_tick = false;

    loop {
        let wait = if engine.connected() || first_tick {
            engine.config.watchdog_interval
        } else {
            engine.config.reconnect_interval
        };
        first_tick = false;

        if starved_last_tick {
            tracing::error!("watchdog: filling buffer with neutral samples");
            inject_fill(&engine, wait).await;
        } else {
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }

        let bytes = engine.take_watchdog_counter();
        starved_last_tick = bytes == 0;
        if starved_last_tick {
            tracing::error!("watchdog: forcing upstream reset now");
            engine.reset_requested.notify_one();
        }
    }
}

/// Streams `0x7F` fill at `2 * sample_rate` bytes/sec for up to `wait_secs`
/// seconds, abandoning early the moment real upstream bytes arrive.
async fn inject_fill(engine: &Arc<Engine>, wait_secs: u64) {
    let fill: Chunk = Chunk::from(vec![FILL_BYTE; FILL_BUFFER_SIZE]);
    let sub_interval = Duration::from_millis(1000 / FILL_SUB_INTERVALS_PER_SEC);
    let mut remaining = Duration::from_secs(wait_secs);

    while remaining > Duration::ZERO {
        remaining = remaining.saturating_sub(sub_interval);

        let bytes_per_sub_interval = 2 * u64::from(engine.sample_rate()) / FILL_SUB_INTERVALS_PER_SEC;
        let buffers_per_sub_interval = bytes_per_sub_interval / FILL_BUFFER_SIZE as u64;
        for _ in 0..buffers_per_sub_interval {
            engine.broadcast(Arc::clone(&fill));
            tokio::task::yield_now().await;
            if engine.watchdog_counter_is_nonzero() {
                return;
            }
        }
        if engine.watchdog_counter_is_nonzero() {
            return;
        }
        tokio::time::sleep(sub_interval).await;
    }
}
