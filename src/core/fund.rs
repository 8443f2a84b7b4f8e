//! Fund identity and directory abstractions

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// A canonical fund code as published by the fund directory, e.g. `"110022"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FundCode(String);

impl FundCode {
    /// Returns `None` for blank input. Surrounding whitespace is dropped.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(FundCode(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FundCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a held position.
///
/// Imported holdings often carry only a free-text fund name. When the name
/// cannot be matched against the directory the position is still kept, tagged
/// as `Unresolved`, and settlement skips it until the code is completed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundId {
    Resolved(FundCode),
    Unresolved(String),
}

impl FundId {
    pub fn code(&self) -> Option<&FundCode> {
        match self {
            FundId::Resolved(code) => Some(code),
            FundId::Unresolved(_) => None,
        }
    }

    /// Parses a user supplied identifier: `name:<text>` selects an unresolved
    /// position, anything else is taken as a fund code.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().strip_prefix("name:") {
            Some(name) if !name.trim().is_empty() => Some(FundId::Unresolved(name.trim().to_string())),
            Some(_) => None,
            None => FundCode::parse(raw).map(FundId::Resolved),
        }
    }
}

impl From<FundCode> for FundId {
    fn from(code: FundCode) -> Self {
        FundId::Resolved(code)
    }
}

impl Display for FundId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FundId::Resolved(code) => write!(f, "{code}"),
            FundId::Unresolved(name) => write!(f, "name:{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundProfile {
    pub code: FundCode,
    pub name: String,
    #[serde(default)]
    pub fund_type: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub managers: Vec<String>,
}

/// Read access to the canonical code → profile mapping.
#[async_trait]
pub trait FundDirectory: Send + Sync {
    async fn get_profile(&self, code: &FundCode) -> Result<Option<FundProfile>>;

    /// Every `(code, name)` pair, in a stable order.
    async fn list_all(&self) -> Result<Vec<(FundCode, String)>>;
}

/// Write access used by directory maintenance.
#[async_trait]
pub trait FundDirectoryWriter: Send + Sync {
    async fn upsert_profile(&self, profile: &FundProfile) -> Result<()>;
}

/// Remote source the directory is populated from. Failures yield `None`.
#[async_trait]
pub trait FundDirectorySource: Send + Sync {
    /// Full profile including company and managers.
    async fn fetch_profile(&self, code: &FundCode) -> Option<FundProfile>;

    /// Every listed fund with code, name and type only.
    async fn fetch_fund_codes(&self) -> Option<Vec<FundProfile>>;
}
