//! Monotonic millisecond clock.
//!
//! All deadlines and durations in the daemon are expressed as milliseconds of
//! a monotonic counter, so a jumping system clock cannot disturb the timer
//! wheel. The wall clock is only used for human-readable stamps. The value
//! returned by [`Clock::now`] is a cached snapshot refreshed by
//! [`Clock::update`] at every scheduler wakeup; within one dispatch iteration
//! time appears frozen.

use std::cell::Cell;
use std::fmt::Write as _;
use std::io;
use std::rc::Rc;

/// Absolute time that is never reached.
pub const NEVER: u64 = u64::MAX;

/// Shared handle to the cached monotonic clock.
#[derive(Clone)]
pub struct Clock {
    now: Rc<Cell<u64>>,
}

impl Clock {
    /// Create a clock and take the first reading. Fails only if the OS
    /// monotonic clock is unreadable.
    pub fn new() -> io::Result<Clock> {
        let clock = Clock {
            now: Rc::new(Cell::new(0)),
        };
        clock.update()?;
        Ok(clock)
    }

    /// Refresh the cached timestamp from the OS.
    pub fn update(&self) -> io::Result<()> {
        self.now.set(os_monotonic_millis()?);
        Ok(())
    }

    /// Cached monotonic time in milliseconds.
    pub fn now(&self) -> u64 {
        self.now.get()
    }

    /// Convert a relative interval into an absolute timestamp.
    pub fn absolute(&self, relative: u64) -> u64 {
        self.now().saturating_add(relative)
    }

    /// Convert an absolute timestamp into a relative interval. Negative means
    /// the timestamp lies in the past.
    pub fn relative(&self, absolute: u64) -> i64 {
        absolute as i64 - self.now() as i64
    }

    /// True if `absolute` is now or earlier.
    pub fn is_past(&self, absolute: u64) -> bool {
        absolute <= self.now()
    }
}

#[cfg(test)]
impl Clock {
    /// Pin the cached timestamp; tests drive time by hand.
    pub(crate) fn set_now(&self, now: u64) {
        self.now.set(now);
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").field("now", &self.now.get()).finish()
    }
}

fn os_monotonic_millis() -> io::Result<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    syscall!(clock_gettime(libc::CLOCK_MONOTONIC, &mut ts))?;
    Ok(ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000)
}

/// Parse a decimal "seconds.milliseconds" interval into milliseconds.
///
/// At most three fractional digits are honored, missing digits are
/// zero-padded and parsing stops at the first character that is neither a
/// digit nor the first dot: `"5"` is 5000, `"1.5"` is 1500, `"0.1234"` is
/// 123.
pub fn parse_interval(text: &str) -> u64 {
    let mut value: u64 = 0;
    let mut fraction_digits = 0;
    let mut in_fraction = false;

    for ch in text.chars() {
        if ch == '.' && !in_fraction {
            in_fraction = true;
            continue;
        }
        if !ch.is_ascii_digit() || fraction_digits >= 3 {
            break;
        }
        value = value * 10 + (ch as u64 - '0' as u64);
        if in_fraction {
            fraction_digits += 1;
        }
    }

    while fraction_digits < 3 {
        value *= 10;
        fraction_digits += 1;
    }
    value
}

/// Format a millisecond count as "seconds.milliseconds".
pub fn format_interval(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

/// Format a monotonic timestamp as "hh:mm:ss.mmm" for logs.
pub fn to_clock_string(ms: u64) -> String {
    let msec = ms % 1000;
    let sec = ms / 1000;

    let mut out = String::new();
    let _ = write!(
        out,
        "{:02}:{:02}:{:02}.{:03}",
        sec / 3600,
        (sec % 3600) / 60,
        sec % 60,
        msec
    );
    out
}

/// RFC 1123 GMT stamp of the current wall-clock time, as used in HTTP
/// `Date:` headers.
pub fn wallclock_http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_and_cached() {
        let clock = Clock::new().unwrap();
        let first = clock.now();
        // No update, no movement.
        assert_eq!(clock.now(), first);
        clock.update().unwrap();
        assert!(clock.now() >= first);
    }

    #[test]
    fn conversions() {
        let clock = Clock::new().unwrap();
        let now = clock.now();
        assert_eq!(clock.absolute(250), now + 250);
        assert_eq!(clock.relative(now + 250), 250);
        assert_eq!(clock.relative(now.saturating_sub(10)), -(10.min(now as i64)));
        assert!(clock.is_past(now));
        assert!(!clock.is_past(now + 1));
    }

    #[test]
    fn parse_interval_variants() {
        assert_eq!(parse_interval("5"), 5000);
        assert_eq!(parse_interval("1.5"), 1500);
        assert_eq!(parse_interval("12.345"), 12345);
        assert_eq!(parse_interval("0.1234"), 123);
        assert_eq!(parse_interval("3.04"), 3040);
        assert_eq!(parse_interval(""), 0);
        assert_eq!(parse_interval("7abc"), 7000);
    }

    #[test]
    fn format_interval_round_trip() {
        for ms in [0, 1, 999, 1000, 1001, 12345] {
            assert_eq!(parse_interval(&format_interval(ms)), ms);
        }
    }

    #[test]
    fn clock_string() {
        assert_eq!(to_clock_string(3_723_456), "01:02:03.456");
    }
}
