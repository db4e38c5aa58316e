// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Operating system family of a bound computer.
///
/// Adapters derive their provider-side `environment` hint from this value;
/// the pool uses it for handle/spec matching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    #[default]
    Linux,
    Macos,
    Windows,
}

impl std::fmt::Display for OsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OsType::Linux => "linux",
            OsType::Macos => "macos",
            OsType::Windows => "windows",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(OsType::Linux),
            "macos" | "mac" | "darwin" => Ok(OsType::Macos),
            "windows" => Ok(OsType::Windows),
            other => Err(format!("unknown os_type: {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialises_lowercase() {
        assert_eq!(serde_json::to_value(OsType::Macos).unwrap(), "macos");
    }

    #[test]
    fn from_str_accepts_aliases() {
        assert_eq!("darwin".parse::<OsType>().unwrap(), OsType::Macos);
        assert_eq!("LINUX".parse::<OsType>().unwrap(), OsType::Linux);
    }

    #[test]
    fn from_str_rejects_unknown() {
        assert!("beos".parse::<OsType>().is_err());
    }
}
