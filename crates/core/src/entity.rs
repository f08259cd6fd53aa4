//! Entity kinds synchronized with the remote API.

use core::str::FromStr;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{DomainError, DomainResult};

/// The collections the engine knows how to persist and synchronize.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Product,
    Store,
    Visit,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Product, EntityKind::Store, EntityKind::Visit];

    /// Plural collection name, used both as the REST path segment and the table name.
    pub fn collection(self) -> &'static str {
        match self {
            Self::Product => "products",
            Self::Store => "stores",
            Self::Visit => "visits",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Store => "store",
            Self::Visit => "visit",
        }
    }
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" | "products" => Ok(Self::Product),
            "store" | "stores" => Ok(Self::Store),
            "visit" | "visits" => Ok(Self::Visit),
            other => Err(DomainError::validation(format!("unknown entity kind {other:?}"))),
        }
    }
}

/// A typed domain model that maps onto one entity collection.
pub trait EntityModel: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The collection this model lives in.
    const KIND: EntityKind;

    /// Deterministic field validation, run before anything is written or sent.
    fn validate(&self) -> DomainResult<()>;
}
