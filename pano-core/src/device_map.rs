use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::PanoramaError;

/// Where the generator's modules are placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl FromStr for DeviceMap {
    type Err = PanoramaError;

    /// Accepts `cpu`, a bare ordinal (`1`), or `cuda:1` / `metal:1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(Self::ForceCpu);
        }
        let ordinal = s
            .strip_prefix("cuda:")
            .or_else(|| s.strip_prefix("metal:"))
            .unwrap_or(&s);
        ordinal
            .parse()
            .map(Self::Ordinal)
            .map_err(|_| PanoramaError::InvalidDevice(s.clone()))
    }
}
