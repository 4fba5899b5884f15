use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque reporting period label such as `FY23` or `LTM-May25`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeriodId(pub String);

impl PeriodId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeriodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two periods compared by one attribution run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodPair {
    pub baseline: PeriodId,
    pub current: PeriodId,
}

impl PeriodPair {
    pub fn new(baseline: PeriodId, current: PeriodId) -> Self {
        Self { baseline, current }
    }

    pub fn is_degenerate(&self) -> bool {
        self.baseline == self.current
    }
}
