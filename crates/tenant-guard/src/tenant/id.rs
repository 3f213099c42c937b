//! Tenant and user identifier types.
//!
//! [`TenantId`] and [`UserId`] are opaque string newtypes. Ids arriving from
//! outside the process are checked with a [`TenantIdValidator`] built from
//! the isolation configuration.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::IsolationConfig;
use crate::error::IsolationError;

/// An opaque tenant identifier.
///
/// # Examples
///
/// ```
/// use helios_tenant_guard::tenant::TenantId;
///
/// let tenant = TenantId::new("clinic-a");
/// assert_eq!(tenant.as_str(), "clinic-a");
/// assert!(!tenant.is_empty());
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant ID from a trusted value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id is empty or only whitespace.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Consumes the ID and returns the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantId({})", self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An opaque user identity issued by the external identity provider.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the user ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validates tenant ids received from callers.
#[derive(Debug, Clone)]
pub struct TenantIdValidator {
    pattern: Regex,
    max_length: usize,
}

impl TenantIdValidator {
    /// Compiles a validator from the isolation configuration.
    pub fn new(config: &IsolationConfig) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&config.tenant_id_pattern)?;
        Ok(Self {
            pattern,
            max_length: config.max_tenant_id_length,
        })
    }

    /// Checks a tenant id against the configured pattern and length.
    pub fn validate(&self, tenant_id: &TenantId) -> Result<(), IsolationError> {
        let invalid = |reason: String| IsolationError::InvalidTenantId {
            tenant_id: tenant_id.as_str().to_string(),
            reason,
        };

        if tenant_id.is_empty() {
            return Err(invalid("tenant id is empty".to_string()));
        }
        if tenant_id.as_str().len() > self.max_length {
            return Err(invalid(format!(
                "longer than {} characters",
                self.max_length
            )));
        }
        if !self.pattern.is_match(tenant_id.as_str()) {
            return Err(invalid(format!(
                "does not match pattern {}",
                self.pattern.as_str()
            )));
        }
        Ok(())
    }
}
