//! Access timeouts and human-readable duration parsing.
//!
//! Every suspension point in the container (pool wait, creation lock, guard
//! wait) is bounded by an [`AccessTimeout`]. Configuration expresses these as
//! signed milliseconds or as text such as `"30 seconds"` or
//! `"1 minute and 15 seconds"`.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Maximum wait for a guard or pool acquisition.
///
/// # Examples
///
/// ```
/// use ferrous_container::AccessTimeout;
/// use std::time::Duration;
///
/// assert_eq!(AccessTimeout::from_millis(0), AccessTimeout::Immediate);
/// assert_eq!(AccessTimeout::from_millis(-1), AccessTimeout::Unbounded);
/// assert_eq!(
///     AccessTimeout::from_millis(250),
///     AccessTimeout::Bounded(Duration::from_millis(250))
/// );
///
/// let parsed: AccessTimeout = "1 minute and 30 seconds".parse().unwrap();
/// assert_eq!(parsed, AccessTimeout::Bounded(Duration::from_secs(90)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessTimeout {
    /// Never wait; fail at once when the resource is busy
    Immediate,
    /// Wait up to the given duration
    Bounded(Duration),
    /// Wait indefinitely
    Unbounded,
}

impl AccessTimeout {
    /// Maps the signed-millisecond convention: `0` immediate, negative unbounded.
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            0 => AccessTimeout::Immediate,
            m if m < 0 => AccessTimeout::Unbounded,
            m => AccessTimeout::Bounded(Duration::from_millis(m as u64)),
        }
    }

    /// Wraps a duration; a zero duration means [`AccessTimeout::Immediate`].
    pub fn from_duration(duration: Duration) -> Self {
        if duration.is_zero() {
            AccessTimeout::Immediate
        } else {
            AccessTimeout::Bounded(duration)
        }
    }

    /// Inverse of [`AccessTimeout::from_millis`].
    pub fn as_millis(&self) -> i64 {
        match self {
            AccessTimeout::Immediate => 0,
            AccessTimeout::Unbounded => -1,
            AccessTimeout::Bounded(d) => d.as_millis().min(i64::MAX as u128) as i64,
        }
    }

    /// Starts the clock for one acquisition.
    pub fn deadline(&self) -> Deadline {
        Deadline::start(*self)
    }
}

impl Default for AccessTimeout {
    fn default() -> Self {
        AccessTimeout::Bounded(Duration::from_secs(30))
    }
}

impl fmt::Display for AccessTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessTimeout::Immediate => write!(f, "0"),
            AccessTimeout::Unbounded => write!(f, "-1"),
            AccessTimeout::Bounded(d) => write!(f, "{}ms", d.as_millis()),
        }
    }
}

impl FromStr for AccessTimeout {
    type Err = DurationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(millis) = trimmed.parse::<i64>() {
            return Ok(AccessTimeout::from_millis(millis));
        }
        parse_duration(trimmed).map(AccessTimeout::from_duration)
    }
}

/// A running acquisition clock derived from an [`AccessTimeout`].
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    timeout: AccessTimeout,
    started: Instant,
    at: Option<Instant>,
}

impl Deadline {
    /// Starts a deadline now.
    pub fn start(timeout: AccessTimeout) -> Self {
        let started = Instant::now();
        let at = match timeout {
            AccessTimeout::Immediate => Some(started),
            AccessTimeout::Bounded(d) => started.checked_add(d),
            AccessTimeout::Unbounded => None,
        };
        Self { timeout, started, at }
    }

    /// The timeout this deadline was started from.
    pub fn timeout(&self) -> AccessTimeout {
        self.timeout
    }

    /// Whether the caller asked never to wait.
    pub fn is_immediate(&self) -> bool {
        self.timeout == AccessTimeout::Immediate
    }

    /// The instant at which waiting must stop, if any.
    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        match self.at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Time spent since the deadline started.
    pub fn waited(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Failure to parse a duration string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationParseError {
    /// Nothing to parse
    #[error("empty duration")]
    Empty,
    /// A number could not be read
    #[error("invalid number in duration: {0}")]
    InvalidNumber(String),
    /// The unit is not recognised
    #[error("unknown time unit: {0}")]
    UnknownUnit(String),
    /// The total does not fit in a `Duration`
    #[error("duration out of range: {0}")]
    Overflow(String),
}

/// Parses durations such as `"250ms"`, `"30 seconds"`, `"2h"` or
/// `"1 hour and 30 minutes"`. A bare number is read as milliseconds.
///
/// ```
/// use ferrous_container::timeout::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
/// assert_eq!(parse_duration("2 minutes, 5s").unwrap(), Duration::from_secs(125));
/// assert!(parse_duration("ten seconds").is_err());
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let text = input.trim().to_ascii_lowercase();
    if text.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let mut total = Duration::ZERO;
    let mut rest = text.as_str();
    let mut parts = 0usize;

    loop {
        rest = skip_separators(rest);
        if rest.is_empty() {
            break;
        }

        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            let word = rest.split_whitespace().next().unwrap_or(rest);
            return Err(DurationParseError::InvalidNumber(word.to_string()));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| DurationParseError::InvalidNumber(rest[..digits].to_string()))?;
        rest = rest[digits..].trim_start();

        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        total = total
            .checked_add(scale(amount, unit)?)
            .ok_or_else(|| DurationParseError::Overflow(input.trim().to_string()))?;
        parts += 1;
    }

    if parts == 0 {
        return Err(DurationParseError::Empty);
    }
    Ok(total)
}

fn skip_separators(mut s: &str) -> &str {
    loop {
        let trimmed = s.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        match trimmed.strip_prefix("and") {
            Some(after) if after.is_empty() || after.starts_with(|c: char| c.is_whitespace() || c == ',') => {
                s = after
            }
            _ => return trimmed,
        }
    }
}

fn scale(amount: u64, unit: &str) -> Result<Duration, DurationParseError> {
    let secs = |factor: u64| {
        amount
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| DurationParseError::Overflow(format!("{}{}", amount, unit)))
    };
    let duration = match unit {
        "" | "ms" | "milli" | "millis" | "millisecond" | "milliseconds" => {
            Duration::from_millis(amount)
        }
        "us" | "micro" | "micros" | "microsecond" | "microseconds" => Duration::from_micros(amount),
        "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs(amount),
        "m" | "min" | "mins" | "minute" | "minutes" => secs(60)?,
        "h" | "hr" | "hrs" | "hour" | "hours" => secs(3_600)?,
        "d" | "day" | "days" => secs(86_400)?,
        other => return Err(DurationParseError::UnknownUnit(other.to_string())),
    };
    Ok(duration)
}
