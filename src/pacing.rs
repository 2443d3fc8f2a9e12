//! Anti-detection pacing between requests.
//!
//! Sleep ranges map a request interval `N` to a `(min, max)` range in
//! seconds: every `N`th request the worker sleeps uniformly inside that
//! range. When several intervals divide the request number the largest
//! one wins; when none does the fallback range `(1, 2)` applies.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Range used when no configured interval divides the request number.
pub const FALLBACK_RANGE: (f64, f64) = (1.0, 2.0);

/// Longest single pause a range may ask for (one day).
pub const MAX_SLEEP_SECS: f64 = 86_400.0;

/// Interval → sleep range table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, [f64; 2]>",
    into = "BTreeMap<String, [f64; 2]>"
)]
pub struct SleepRanges(BTreeMap<u32, (f64, f64)>);

impl SleepRanges {
    pub fn new(ranges: impl IntoIterator<Item = (u32, (f64, f64))>) -> Self {
        Self(ranges.into_iter().collect())
    }

    /// `{1:(1,2), 5:(2,4), 30:(10,20), 127:(30,50)}`
    pub fn default_ranges() -> Self {
        Self::new([
            (1, (1.0, 2.0)),
            (5, (2.0, 4.0)),
            (30, (10.0, 20.0)),
            (127, (30.0, 50.0)),
        ])
    }

    /// Slower table used for google.
    pub fn google_ranges() -> Self {
        Self::new([
            (1, (2.0, 3.0)),
            (5, (3.0, 5.0)),
            (30, (10.0, 20.0)),
            (127, (30.0, 50.0)),
        ])
    }

    /// No sleeping at all. Handy for tests and cached replays.
    pub fn none() -> Self {
        Self::new([(1, (0.0, 0.0))])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Problems with this table, empty when valid.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.0.is_empty() {
            problems.push("sleep ranges must not be empty".to_string());
        }
        for (n, (lo, hi)) in &self.0 {
            if *n == 0 {
                problems.push("sleep range interval must be positive".to_string());
            }
            if !lo.is_finite() || !hi.is_finite() {
                problems.push(format!("sleep range for {} must be finite", n));
            } else if *lo < 0.0 || hi < lo {
                problems.push(format!("sleep range for {} must satisfy 0 <= min <= max", n));
            } else if *hi > MAX_SLEEP_SECS {
                problems.push(format!(
                    "sleep range for {} must not exceed {} seconds",
                    n, MAX_SLEEP_SECS
                ));
            }
        }
        problems
    }

    /// The range that applies to the `search_number`th request.
    pub fn range_for(&self, search_number: u64) -> (f64, f64) {
        if search_number == 0 {
            return FALLBACK_RANGE;
        }
        self.0
            .iter()
            .rev()
            .find(|(n, _)| search_number % u64::from(**n) == 0)
            .map(|(_, range)| *range)
            .unwrap_or(FALLBACK_RANGE)
    }

    /// Random delay for the `search_number`th request. Bounds outside
    /// `0..=MAX_SLEEP_SECS` are clamped, NaN counts as zero.
    pub fn delay_for(&self, search_number: u64) -> Duration {
        let (lo, hi) = self.range_for(search_number);
        let clamp = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, MAX_SLEEP_SECS) };
        let (lo, hi) = (clamp(lo), clamp(hi));
        let secs = if hi > lo {
            rand::rng().random_range(lo..=hi)
        } else {
            lo
        };
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }
}

impl Default for SleepRanges {
    fn default() -> Self {
        Self::default_ranges()
    }
}

impl TryFrom<BTreeMap<String, [f64; 2]>> for SleepRanges {
    type Error = String;

    fn try_from(raw: BTreeMap<String, [f64; 2]>) -> std::result::Result<Self, Self::Error> {
        let mut ranges = BTreeMap::new();
        for (key, [lo, hi]) in raw {
            let n: u32 = key
                .trim()
                .parse()
                .map_err(|_| format!("sleep range key '{}' is not a request interval", key))?;
            ranges.insert(n, (lo, hi));
        }
        Ok(Self(ranges))
    }
}

impl From<SleepRanges> for BTreeMap<String, [f64; 2]> {
    fn from(ranges: SleepRanges) -> Self {
        ranges
            .0
            .into_iter()
            .map(|(n, (lo, hi))| (n.to_string(), [lo, hi]))
            .collect()
    }
}
