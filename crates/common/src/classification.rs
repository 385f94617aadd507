use serde::{Deserialize, Serialize};

/// The category assigned to an error to drive retry decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Unknown,
    Transient,
    Permanent,
}

impl Classification {
    pub fn should_retry(self, attempt: u32, max_attempts: u32) -> bool {
        self == Classification::Transient && attempt < max_attempts
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Classification::Unknown => "unknown",
            Classification::Transient => "transient",
            Classification::Permanent => "permanent",
        };
        write!(f, "{s}")
    }
}
