//! Compact duration notation: `90s`, `1h30m`, `720h`, `1.5h`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// A duration carried over the API and in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiDuration(pub Duration);

impl ApiDuration {
    pub fn from_secs(secs: u64) -> Self {
        ApiDuration(Duration::from_secs(secs))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for ApiDuration {
    fn from(d: Duration) -> Self {
        ApiDuration(d)
    }
}

/// Parses a sequence of `<number><unit>` pairs. Units: `ms`, `s`, `m`, `h`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("invalid duration: empty".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("invalid duration {:?}: missing unit", input))?;
        if num_end == 0 {
            return Err(format!("invalid duration {:?}", input));
        }
        let value: f64 = rest[..num_end]
            .parse()
            .map_err(|_| format!("invalid duration {:?}", input))?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let factor = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            unit => return Err(format!("invalid duration {:?}: unknown unit {:?}", input, unit)),
        };
        total_nanos += value * factor;
        rest = &rest[unit_end..];
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(format!("invalid duration {:?}: out of range", input));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Renders like `12h0m0s`, `1m30s`, `45s`, `1.5s`, `250ms`, `0s`.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d < Duration::from_secs(1) {
        let ms = d.as_secs_f64() * 1000.0;
        return format!("{}ms", trim_float(ms));
    }

    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = (total % 60) as f64 + f64::from(d.subsec_nanos()) / 1e9;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{}s", trim_float(secs)));
    out
}

fn trim_float(v: f64) -> String {
    let s = format!("{:.9}", v);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

impl fmt::Display for ApiDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_duration(self.0))
    }
}

impl std::str::FromStr for ApiDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(ApiDuration)
    }
}

impl Serialize for ApiDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ApiDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(ApiDuration::default());
        }
        parse_duration(&s)
            .map(ApiDuration)
            .map_err(serde::de::Error::custom)
    }
}
