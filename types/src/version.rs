//! Worker API versions.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid worker version: {0:?}")]
pub struct ApiVersionError(String);

/// `major.minor.patch` version of the worker's API.
///
/// Pre-release and build suffixes (`5.5.0-dev.20240101`) are accepted and
/// ignored for comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    major: u32,
    minor: u32,
    patch: u32,
}

impl ApiVersion {
    /// First version that understands `configurePlugin`.
    pub const V314: Self = Self::new(3, 1, 4);
    /// Newest version the bridge knows about; used when none is configured.
    pub const LATEST: Self = Self::new(5, 4, 0);

    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    #[must_use]
    pub fn gte(self, other: Self) -> bool {
        self >= other
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl FromStr for ApiVersion {
    type Err = ApiVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let core = trimmed
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        let mut parts = core.split('.');
        let mut next = |required: bool| -> Result<u32, ApiVersionError> {
            match parts.next() {
                Some(part) => part.parse().map_err(|_| ApiVersionError(s.to_string())),
                None if required => Err(ApiVersionError(s.to_string())),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(false)?;
        let patch = next(false)?;
        if parts.next().is_some() {
            return Err(ApiVersionError(s.to_string()));
        }
        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
