//! Device tick to host time conversion.
//!
//! Every device connection owns one [`ClockContext`]. The first stream that
//! reports a non-zero device tick pins the shared reference (device tick plus
//! host time); each stream then keeps its own [`StreamClock`] that counts
//! 32-bit wraparounds relative to that reference, so timestamps from
//! different streams land on one timeline.

use crate::dump::{DumpSink, NullDump, TimestampRecord};
use crate::error::ProtocolError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WRAP_POINT: u64 = 1 << 32;

/// Monotonic host time source, in microseconds.
pub trait HostClock: Send + Sync {
    fn now_us(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Host clock that only moves when told to. Used for replaying captures.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(start_us),
        }
    }

    pub fn set(&self, us: u64) {
        self.now_us.store(us, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_us.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }
}

impl HostClock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

/// Time zero of a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReference {
    pub device_tick: u32,
    pub host_us: u64,
}

/// Per-connection clock state shared by all streams.
pub struct ClockContext {
    host: Arc<dyn HostClock>,
    /// Device ticks per microsecond
    frequency: f64,
    reference: OnceLock<ClockReference>,
    dump: Arc<dyn DumpSink>,
}

pub type SharedClock = Arc<ClockContext>;

impl ClockContext {
    pub fn new(host: Arc<dyn HostClock>, frequency: f64) -> Self {
        Self {
            host,
            frequency,
            reference: OnceLock::new(),
            dump: Arc::new(NullDump),
        }
    }

    pub fn with_dump(mut self, dump: Arc<dyn DumpSink>) -> Self {
        self.dump = dump;
        self
    }

    pub fn shared(self) -> SharedClock {
        Arc::new(self)
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn now_us(&self) -> u64 {
        self.host.now_us()
    }

    pub fn reference(&self) -> Option<ClockReference> {
        self.reference.get().copied()
    }

    /// Pin the shared reference unless another stream already did.
    ///
    /// Only the first writer wins; later callers get the existing value
    /// without taking the lock.
    fn establish(&self, device_tick: u32, host_us: u64) -> ClockReference {
        *self.reference.get_or_init(|| {
            info!(device_tick, host_us, "Clock reference established");
            ClockReference { device_tick, host_us }
        })
    }

    /// Elapsed host time since the shared reference, for streams whose
    /// device timestamps cannot be trusted.
    pub fn host_only_time(&self) -> u64 {
        let now = self.now_us();
        let reference = self.establish(now as u32, now);
        now.saturating_sub(reference.host_us)
    }
}

/// Wrap bookkeeping of one stream, relative to its latest local reference.
#[derive(Debug, Clone, Copy)]
struct WrapState {
    reference_tick: u32,
    total_at_reference: u64,
    last_tick: u32,
}

/// Converts one stream's device ticks to microseconds on the shared timeline.
pub struct StreamClock {
    context: SharedClock,
    name: String,
    tolerance_ms: u64,
    state: Option<WrapState>,
    last_result_ms: u64,
}

impl StreamClock {
    pub fn new(context: SharedClock, name: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            context,
            name: name.into(),
            tolerance_ms: tolerance.as_millis() as u64,
            state: None,
            last_result_ms: 0,
        }
    }

    pub fn context(&self) -> &SharedClock {
        &self.context
    }

    /// Forget the wrap history; the next tick re-derives it from host time.
    pub fn reset(&mut self) {
        self.state = None;
        self.last_result_ms = 0;
    }

    /// Estimate how many wraps separate `tick` from the shared reference.
    fn initial_state(&self, tick: u32, now: u64, reference: ClockReference) -> (WrapState, u32) {
        let frequency = self.context.frequency;
        let os_time = now.saturating_sub(reference.host_us) as f64;
        let wrap_us = WRAP_POINT as f64 / frequency;

        let mut wraps = (os_time / wrap_us) as i64;
        let estimated_ticks = wraps * WRAP_POINT as i64 + i64::from(tick) - i64::from(reference.device_tick);
        let estimated_time = estimated_ticks as f64 / frequency;

        if estimated_time < os_time - 0.5 * wrap_us {
            wraps += 1;
        } else if estimated_time > os_time + 0.5 * wrap_us {
            wraps -= 1;
        }

        // A first tick "before" time zero comes from transport latency
        // between streams: start this stream exactly at the reference.
        let mut tick = tick;
        if wraps < 0 || (wraps == 0 && tick < reference.device_tick) {
            tick = reference.device_tick;
            wraps = 0;
        }

        let state = WrapState {
            reference_tick: reference.device_tick,
            total_at_reference: wraps as u64 * WRAP_POINT,
            last_tick: 0,
        };
        (state, tick)
    }

    /// Device tick to microseconds since the shared reference.
    ///
    /// Returns 0 while no stream has reported a usable tick yet.
    pub fn to_host_time(&mut self, tick: u32) -> u64 {
        let now = self.context.now_us();
        let reference = match self.context.reference() {
            Some(reference) => reference,
            None if tick == 0 => return 0,
            None => self.context.establish(tick, now),
        };

        let mut resynced = false;
        loop {
            let mut comment = String::new();
            let mut tick = tick;
            let check_sanity = match self.state {
                Some(_) => true,
                None => {
                    let (state, clamped) = self.initial_state(tick, now, reference);
                    comment = format!("Init. Total ticks at reference: {}", state.total_at_reference);
                    self.state = Some(state);
                    tick = clamped;
                    false
                }
            };

            let Some(state) = self.state.as_mut() else {
                return 0;
            };
            let result_ticks = if tick > state.last_tick {
                state.total_at_reference + u64::from(tick) - u64::from(state.reference_tick)
            } else {
                state.total_at_reference += WRAP_POINT + u64::from(tick) - u64::from(state.reference_tick);
                state.reference_tick = tick;
                comment = format!(
                    "Wrap around. Reference tick: {} / total ticks at reference: {}",
                    state.reference_tick, state.total_at_reference
                );
                state.total_at_reference
            };
            state.last_tick = tick;

            let result_us = (result_ticks as f64 / self.context.frequency) as u64;
            let result_ms = result_us / 1000;
            let verdict = if check_sanity {
                self.check_sanity(result_ms)
            } else {
                Ok(())
            };
            if verdict.is_err() {
                comment.push_str(",Didn't pass sanity. Will try to re-sync.");
            }

            self.context.dump.timestamp(&TimestampRecord {
                host_us: now,
                stream: &self.name,
                device_tick: tick,
                result_us,
                comment: &comment,
            });

            match verdict {
                Err(err) if !resynced => {
                    warn!(
                        stream = %self.name,
                        tick,
                        result_ms,
                        last_ms = self.last_result_ms,
                        %err,
                        "Timestamp jumped, resynchronising stream clock"
                    );
                    self.state = None;
                    resynced = true;
                }
                _ => {
                    self.last_result_ms = result_ms;
                    return result_us;
                }
            }
        }
    }

    fn check_sanity(&self, result_ms: u64) -> Result<(), ProtocolError> {
        if result_ms > self.last_result_ms + self.tolerance_ms {
            debug!(stream = %self.name, result_ms, "Timestamp failed sanity check");
            return Err(ProtocolError::ClockDesync);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(start_us: u64) -> (Arc<ManualClock>, SharedClock) {
        let host = Arc::new(ManualClock::new(start_us));
        let ctx = ClockContext::new(host.clone(), 60.0).shared();
        (host, ctx)
    }

    #[test]
    fn first_tick_is_time_zero() {
        let (_host, ctx) = context(1_000);
        let mut clock = StreamClock::new(ctx.clone(), "depth", Duration::from_secs(10));
        assert_eq!(clock.to_host_time(6_000), 0);
        assert_eq!(clock.to_host_time(6_060), 1);
        assert_eq!(ctx.reference().unwrap().device_tick, 6_000);
    }

    #[test]
    fn zero_tick_does_not_establish_reference() {
        let (_host, ctx) = context(0);
        let mut clock = StreamClock::new(ctx.clone(), "depth", Duration::from_secs(10));
        assert_eq!(clock.to_host_time(0), 0);
        assert!(ctx.reference().is_none());
    }

    #[test]
    fn late_stream_clamps_to_reference() {
        let (_host, ctx) = context(0);
        let mut depth = StreamClock::new(ctx.clone(), "depth", Duration::from_secs(10));
        let mut image = StreamClock::new(ctx, "image", Duration::from_secs(10));
        depth.to_host_time(100_000);
        // Tick slightly before time zero, same wrap period
        assert_eq!(image.to_host_time(99_000), 0);
    }

    #[test]
    fn second_stream_finds_elapsed_wraps() {
        let (host, ctx) = context(0);
        let mut depth = StreamClock::new(ctx.clone(), "depth", Duration::from_secs(10));
        let mut image = StreamClock::new(ctx, "image", Duration::from_secs(10));
        depth.to_host_time(1_000);

        // Two full wraps (about 143 s at 60 MHz) plus 1 s later
        let wrap_us = WRAP_POINT / 60;
        host.advance(Duration::from_micros(2 * wrap_us + 1_000_000));
        let t = image.to_host_time(1_000 + 60_000_000);
        let expected = (2 * WRAP_POINT + 60_000_000) / 60;
        assert_eq!(t, expected);
    }

    #[test]
    fn host_only_time_uses_shared_reference() {
        let (host, ctx) = context(5_000);
        assert_eq!(ctx.host_only_time(), 0);
        host.advance(Duration::from_millis(3));
        assert_eq!(ctx.host_only_time(), 3_000);
    }
}
