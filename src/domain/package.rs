use super::actor::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(String);

impl PackageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for PackageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A service package as published in the catalog.
///
/// Packages are owned by the catalog collaborator; the core only reads them
/// when an order is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePackage {
    pub id: PackageId,
    pub provider: UserId,
    pub title: String,
    pub active: bool,
    /// Days the provider has to deliver. Falls back to the configured default.
    pub delivery_days: Option<u32>,
}

impl ServicePackage {
    pub fn new(id: impl Into<PackageId>, provider: impl Into<UserId>) -> Self {
        let id = id.into();
        Self {
            title: id.to_string(),
            id,
            provider: provider.into(),
            active: true,
            delivery_days: None,
        }
    }

    pub fn with_delivery_days(mut self, days: u32) -> Self {
        self.delivery_days = Some(days);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}
