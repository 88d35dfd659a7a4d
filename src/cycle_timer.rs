//! Bus-time arithmetic for the isochronous cycle timer.
//!
//! The cycle timer runs at 24.576 MHz. Its register packs a 7-bit seconds
//! field, a 13-bit cycle field (8000 cycles per second) and a 12-bit offset
//! field (3072 ticks per cycle), so both the tick count and the cycle count
//! wrap every 128 seconds.

/// Ticks per isochronous cycle.
pub const TICKS_PER_CYCLE: u64 = 3072;
/// Isochronous cycles per second.
pub const CYCLES_PER_SECOND: u64 = 8000;
/// Ticks per second of bus time.
pub const TICKS_PER_SECOND: u64 = TICKS_PER_CYCLE * CYCLES_PER_SECOND;
/// Seconds after which the cycle timer wraps.
pub const SECONDS_WRAP: u64 = 128;
/// Tick count wrap period.
pub const TICKS_WRAP: u64 = SECONDS_WRAP * TICKS_PER_SECOND;
/// Cycle count wrap period.
pub const CYCLE_WRAP: u64 = SECONDS_WRAP * CYCLES_PER_SECOND;

const OFFSET_BITS: u32 = 12;
const CYCLE_BITS: u32 = 13;
const OFFSET_MASK: u32 = (1 << OFFSET_BITS) - 1;
const CYCLE_MASK: u32 = (1 << CYCLE_BITS) - 1;

/// Reduce a tick count into `[0, TICKS_WRAP)`.
pub fn wrap_ticks(ticks: u64) -> u64 {
    ticks % TICKS_WRAP
}

/// Add a signed tick offset, wrapping around the tick period.
pub fn add_ticks(ticks: u64, delta: i64) -> u64 {
    (ticks as i128 + delta as i128).rem_euclid(TICKS_WRAP as i128) as u64
}

/// Signed difference `a - b` between two tick stamps, unwrapped to the
/// shortest distance around the tick period.
pub fn diff_ticks(a: u64, b: u64) -> i64 {
    unwrap_signed(a as i128 - b as i128, TICKS_WRAP)
}

/// Cycle count (within the cycle wrap) covering a tick stamp.
pub fn ticks_to_cycles(ticks: u64) -> u64 {
    wrap_ticks(ticks) / TICKS_PER_CYCLE
}

/// Tick stamp of the start of a cycle.
pub fn cycles_to_ticks(cycles: u64) -> u64 {
    (cycles % CYCLE_WRAP) * TICKS_PER_CYCLE
}

/// Signed forward distance from `now` to `deadline` in a counter that wraps
/// every `wrap` units. Positive means the deadline is still ahead.
///
/// Raw differences are folded into `(-wrap/2, wrap/2]`, so a deadline issued
/// just before the counter wraps still reports the short forward distance.
pub fn signed_cycle_distance(now: u64, deadline: u64, wrap: u64) -> i64 {
    unwrap_signed(deadline as i128 - now as i128, wrap.max(1))
}

/// Decode a packed cycle-timer register into ticks.
pub fn cycle_timer_to_ticks(ctr: u32) -> u64 {
    let seconds = (ctr >> (OFFSET_BITS + CYCLE_BITS)) as u64;
    let cycles = ((ctr >> OFFSET_BITS) & CYCLE_MASK) as u64;
    let offset = (ctr & OFFSET_MASK) as u64;
    seconds * TICKS_PER_SECOND + cycles * TICKS_PER_CYCLE + offset
}

/// Pack a tick stamp into the cycle-timer register layout.
pub fn ticks_to_cycle_timer(ticks: u64) -> u32 {
    let ticks = wrap_ticks(ticks);
    let seconds = (ticks / TICKS_PER_SECOND) as u32;
    let cycles = ((ticks / TICKS_PER_CYCLE) % CYCLES_PER_SECOND) as u32;
    let offset = (ticks % TICKS_PER_CYCLE) as u32;
    (seconds << (OFFSET_BITS + CYCLE_BITS)) | (cycles << OFFSET_BITS) | offset
}

fn unwrap_signed(diff: i128, wrap: u64) -> i64 {
    let wrap = wrap as i128;
    let mut folded = diff.rem_euclid(wrap);
    if folded > wrap / 2 {
        folded -= wrap;
    }
    folded as i64
}
