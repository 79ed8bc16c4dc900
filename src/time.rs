use serde::{Deserialize, Deserializer};
use std::fmt::Display;
use std::ops::{Deref, Neg};
use std::str::FromStr;
use std::time::Duration;

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    cyborgtime::parse_duration(s).map_err(|e| format!("Invalid duration: {e}"))
}

/// A duration as written by an operator (`14d`, `4h 30m`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDuration {
    inner: Duration,
}

impl From<Duration> for ParsedDuration {
    fn from(inner: Duration) -> Self {
        ParsedDuration { inner }
    }
}

impl Deref for ParsedDuration {
    type Target = Duration;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl FromStr for ParsedDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(ParsedDuration::from)
    }
}

impl<'de> Deserialize<'de> for ParsedDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Display for ParsedDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match time::Duration::try_from(self.inner) {
            Ok(duration) => write!(f, "{}", humanize_duration(duration)),
            Err(_) => write!(f, "Time too long to display"),
        }
    }
}

/// Whether a certificate expiring in `remaining` is inside the renewal window.
pub fn renewal_due(remaining: time::Duration, renew_buffer: Duration) -> bool {
    match time::Duration::try_from(renew_buffer) {
        Ok(buffer) => remaining <= buffer,
        // A buffer beyond time::Duration's range covers every possible expiry
        Err(_) => true,
    }
}

pub fn humanize_duration(duration: time::Duration) -> String {
    const SECONDS_IN_MINUTE: i64 = 60;
    const SECONDS_IN_HOUR: i64 = 3600;
    const SECONDS_IN_DAY: i64 = 86400;

    let duration = if duration.is_negative() {
        duration.neg()
    } else {
        duration
    };
    let total = duration.whole_seconds();
    let units = [
        (total / SECONDS_IN_DAY, "day"),
        ((total % SECONDS_IN_DAY) / SECONDS_IN_HOUR, "hour"),
        ((total % SECONDS_IN_HOUR) / SECONDS_IN_MINUTE, "minute"),
    ];

    let components = units
        .iter()
        .filter(|(amount, _)| *amount > 0)
        .map(|(amount, unit)| format!("{amount} {unit}{}", if *amount > 1 { "s" } else { "" }))
        .collect::<Vec<_>>();
    if components.is_empty() {
        let seconds = total % SECONDS_IN_MINUTE;
        return format!("{seconds} second{}", if seconds == 1 { "" } else { "s" });
    }
    components.join(", ")
}
