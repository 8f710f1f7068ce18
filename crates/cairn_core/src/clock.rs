use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::{GraphError, GraphResult};

/// Microseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

static LAST_ISSUED: Lazy<Mutex<i64>> = Lazy::new(|| Mutex::new(0));

impl Timestamp {
    /// Wall-clock time, nudged forward so consecutive calls never repeat.
    /// Versions are ordered by these stamps, so two writes in the same
    /// microsecond must still be distinguishable.
    pub fn now() -> Self {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as i64;
        let mut last = match LAST_ISSUED.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = if physical > *last { physical } else { *last + 1 };
        *last = next;
        Timestamp(next)
    }

    pub fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    pub fn plus_micros(self, delta: i64) -> Self {
        Timestamp(self.0.saturating_add(delta))
    }

    pub fn minus_micros(self, delta: i64) -> Self {
        Timestamp(self.0.saturating_sub(delta))
    }

    pub fn to_rfc3339(self) -> GraphResult<String> {
        let nanos = i128::from(self.0) * 1_000;
        let moment = OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .map_err(|err| GraphError::invalid(format!("timestamp out of range: {err}")))?;
        moment
            .format(&Rfc3339)
            .map_err(|err| GraphError::invalid(format!("format timestamp: {err}")))
    }

    pub fn parse_rfc3339(value: &str) -> GraphResult<Self> {
        let moment = OffsetDateTime::parse(value, &Rfc3339)
            .map_err(|err| GraphError::invalid(format!("invalid timestamp '{value}': {err}")))?;
        Ok(Timestamp((moment.unix_timestamp_nanos() / 1_000) as i64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_rfc3339() {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "{}us", self.0),
        }
    }
}

/// Half-open `[from, to)` validity range. Missing bounds are unbounded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct EffectivityWindow {
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
}

impl EffectivityWindow {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn starting(from: Timestamp) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    pub fn between(from: Timestamp, to: Timestamp) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn validate(&self) -> GraphResult<()> {
        if let (Some(from), Some(to)) = (self.from, self.to)
            && to <= from
        {
            return Err(GraphError::invalid(format!(
                "effectivity window ends ({to}) before it starts ({from})"
            )));
        }
        Ok(())
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        let after_start = self.from.is_none_or(|from| from <= at);
        let before_end = self.to.is_none_or(|to| at < to);
        after_start && before_end
    }

    /// Close the window at `at`, keeping an earlier end if one is already set.
    pub fn closed_at(&self, at: Timestamp) -> Self {
        let to = match self.to {
            Some(existing) if existing <= at => existing,
            _ => at,
        };
        Self {
            from: self.from,
            to: Some(to),
        }
    }
}
