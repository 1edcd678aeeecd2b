//! Byte sizes as reported by repositories
//!
//! Repositories report their size as a human-readable string ("512 MiB",
//! "1.5Gi", "2GB", "1048576"). Sizes are accumulated as exact byte counts and
//! formatted back in a single binary unit.

use std::fmt;
use std::iter::Sum;
use std::num::{IntErrorKind, ParseIntError};
use std::ops::Add;
use std::str::FromStr;

use thiserror::Error;

/// Maximum number of fractional digits accepted
const MAX_FRACTION_DIGITS: u32 = 18;

const BINARY_UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Reasons a size string is rejected
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SizeParseError {
    /// The string is empty
    #[error("size is empty")]
    Empty,

    /// The numeric part is not a non-negative decimal
    #[error("invalid number in size '{0}'")]
    InvalidNumber(String),

    /// The unit suffix is not recognised
    #[error("unknown size unit '{unit}' in '{input}'")]
    UnknownUnit {
        /// The rejected unit
        unit: String,
        /// The full input
        input: String,
    },

    /// The value does not fit in the accumulator
    #[error("size '{0}' is too large")]
    Overflow(String),
}

/// An exact number of bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u128);

impl ByteSize {
    /// Zero bytes
    pub const ZERO: ByteSize = ByteSize(0);

    /// Number of bytes
    pub fn bytes(&self) -> u128 {
        self.0
    }

    /// Saturating addition
    pub fn saturating_add(self, other: ByteSize) -> ByteSize {
        ByteSize(self.0.saturating_add(other.0))
    }
}

impl Add for ByteSize {
    type Output = ByteSize;

    fn add(self, other: ByteSize) -> ByteSize {
        self.saturating_add(other)
    }
}

impl Sum for ByteSize {
    fn sum<I: Iterator<Item = ByteSize>>(iter: I) -> ByteSize {
        iter.fold(ByteSize::ZERO, Add::add)
    }
}

fn multiplier(unit: &str) -> Option<u128> {
    let (base, exp): (u128, u32) = match unit {
        "" | "B" => (1, 0),
        "KiB" | "Ki" => (1024, 1),
        "MiB" | "Mi" => (1024, 2),
        "GiB" | "Gi" => (1024, 3),
        "TiB" | "Ti" => (1024, 4),
        "PiB" | "Pi" => (1024, 5),
        "EiB" | "Ei" => (1024, 6),
        "kB" | "KB" | "k" => (1000, 1),
        "MB" | "M" => (1000, 2),
        "GB" | "G" => (1000, 3),
        "TB" | "T" => (1000, 4),
        "PB" | "P" => (1000, 5),
        "EB" | "E" => (1000, 6),
        _ => return None,
    };
    Some(base.pow(exp))
}

/// Parse a size string into an exact byte count.
///
/// Fractional bytes round half up.
pub fn parse(input: &str) -> Result<ByteSize, SizeParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SizeParseError::Empty);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let unit = unit.trim_start();

    let invalid = || SizeParseError::InvalidNumber(input.to_string());
    let overflow = || SizeParseError::Overflow(input.to_string());

    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if fraction.len() > MAX_FRACTION_DIGITS as usize {
        return Err(invalid());
    }

    let mult = multiplier(unit).ok_or_else(|| SizeParseError::UnknownUnit {
        unit: unit.to_string(),
        input: input.to_string(),
    })?;

    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|e: ParseIntError| match e.kind() {
            IntErrorKind::PosOverflow => overflow(),
            _ => invalid(),
        })?
    };
    let whole_bytes = whole.checked_mul(mult).ok_or_else(overflow)?;

    let fraction_bytes = if fraction.is_empty() {
        0
    } else {
        let digits = fraction.len() as u32;
        let numerator: u128 = fraction.parse().map_err(|_| invalid())?;
        let scale = 10u128.pow(digits);
        let scaled = numerator.checked_mul(mult).ok_or_else(overflow)?;
        (scaled + scale / 2) / scale
    };

    whole_bytes
        .checked_add(fraction_bytes)
        .map(ByteSize)
        .ok_or_else(overflow)
}

impl FromStr for ByteSize {
    type Err = SizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// `bytes` in hundredths of the binary unit at `index`, rounded half up
fn hundredths_of(bytes: u128, index: usize) -> u128 {
    let unit = 1u128 << (10 * index);
    let whole = (bytes / unit).saturating_mul(100);
    whole.saturating_add(((bytes % unit) * 100 + unit / 2) / unit)
}

/// Format a byte count in the largest binary unit not exceeding it,
/// with at most two decimals and trailing zeros trimmed.
pub fn format(size: ByteSize) -> String {
    let bytes = size.0;

    let mut index = 0;
    while index + 1 < BINARY_UNITS.len() && bytes >= 1u128 << (10 * (index + 1)) {
        index += 1;
    }

    let mut hundredths = hundredths_of(bytes, index);
    if hundredths >= 1024 * 100 && index + 1 < BINARY_UNITS.len() {
        index += 1;
        hundredths = hundredths_of(bytes, index);
    }

    let whole = hundredths / 100;
    let cents = hundredths % 100;
    let number = match (cents, cents % 10) {
        (0, _) => whole.to_string(),
        (c, 0) => format!("{}.{}", whole, c / 10),
        (c, _) => format!("{}.{:02}", whole, c),
    };
    format!("{} {}", number, BINARY_UNITS[index])
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format(*self))
    }
}
