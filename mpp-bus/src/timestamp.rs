//! Time bases, rescaling and the decode-order timestamp registry.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// A rational number used both as a time base and as a frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const MILLISECONDS: Rational = Rational { num: 1, den: 1000 };
    pub const MICROSECONDS: Rational = Rational { num: 1, den: 1_000_000 };
    pub const MPEG: Rational = Rational { num: 1, den: 90_000 };

    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn invert(&self) -> Self {
        Self {
            num: self.den,
            den: self.num,
        }
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl Display for Rational {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Rescales `value` from time base `from` to time base `to`, rounding to the
/// nearest integer with halves away from zero.
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    if from == to {
        return value;
    }
    let num = value as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    if den == 0 {
        return value;
    }
    let sign = if (num < 0) != (den < 0) { -1 } else { 1 };
    let rounded = sign * ((num.abs() + den.abs() / 2) / den.abs());
    rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Duration of one frame at `frame_rate`, expressed in `time_base` units.
pub fn frame_duration(frame_rate: Rational, time_base: Rational) -> i64 {
    rescale(1, frame_rate.invert(), time_base).max(1)
}

/// Maps decode order to presentation order.
///
/// Every presentation timestamp submitted to an encoder is recorded; each
/// output packet that arrives without a decode timestamp takes the smallest
/// outstanding one, which is the decode timestamp a reordering encoder would
/// have assigned.
#[derive(Debug, Default)]
pub struct TimestampRegistry {
    pending: BinaryHeap<Reverse<i64>>,
    last_dts: Option<i64>,
}

impl TimestampRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pts: i64) {
        self.pending.push(Reverse(pts));
    }

    /// Takes the next decode timestamp. Falls back to one past the last
    /// handed out value when nothing is outstanding.
    pub fn next_dts(&mut self) -> Option<i64> {
        let dts = match self.pending.pop() {
            Some(Reverse(pts)) => Some(pts),
            None => self.last_dts.map(|d| d + 1),
        };
        if let (Some(d), Some(last)) = (dts, self.last_dts) {
            if d <= last {
                self.last_dts = Some(last + 1);
                return self.last_dts;
            }
        }
        if dts.is_some() {
            self.last_dts = dts;
        }
        dts
    }

    /// Drops a presentation timestamp that the encoder reported itself.
    pub fn remove(&mut self, pts: i64) {
        if self.pending.peek() == Some(&Reverse(pts)) {
            self.pending.pop();
            return;
        }
        let rest: Vec<_> = self.pending.drain().filter(|r| r.0 != pts).collect();
        self.pending.extend(rest);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
#[path = "timestamp_test.rs"]
mod timestamp_test;
