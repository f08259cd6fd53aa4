//! Typed domain models for the three synchronized collections.
//!
//! Field names follow the REST API (camelCase). Validation mirrors what the
//! server enforces so an invalid value is rejected before it is queued.

use serde::{Deserialize, Serialize};

use crate::entity::{EntityKind, EntityModel};
use crate::error::{DomainError, DomainResult};

fn require_text(field: &str, value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} is required")));
    }
    if value.contains(['<', '>']) {
        return Err(DomainError::validation(format!(
            "{field} must not contain angle brackets"
        )));
    }
    Ok(())
}

fn require_range(field: &str, value: f64, min: f64, max: f64) -> DomainResult<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(DomainError::validation(format!(
            "{field} must be between {min} and {max}"
        )));
    }
    Ok(())
}

/// Catalogue product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub name: String,
    pub description: String,
    pub base_price: f64,
}

impl Product {
    pub fn new(name: impl Into<String>, description: impl Into<String>, base_price: f64) -> Self {
        Self {
            name: name.into().trim().to_string(),
            description: description.into().trim().to_string(),
            base_price,
        }
    }
}

impl EntityModel for Product {
    const KIND: EntityKind = EntityKind::Product;

    fn validate(&self) -> DomainResult<()> {
        require_text("name", &self.name)?;
        require_text("description", &self.description)?;
        if !self.base_price.is_finite() || self.base_price < 1.0 {
            return Err(DomainError::validation(
                "basePrice must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// A point of sale visited by drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    pub name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
}

impl Store {
    pub fn new(name: impl Into<String>, address: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into().trim().to_string(),
            address: address.into().trim().to_string(),
            latitude,
            longitude,
            qr_code: None,
        }
    }
}

impl EntityModel for Store {
    const KIND: EntityKind = EntityKind::Store;

    fn validate(&self) -> DomainResult<()> {
        require_text("name", &self.name)?;
        require_text("address", &self.address)?;
        require_range("latitude", self.latitude, -90.0, 90.0)?;
        require_range("longitude", self.longitude, -180.0, 180.0)
    }
}

/// One product line delivered during a visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub product_uuid: String,
    pub quantity: u32,
}

/// A driver's registered visit to a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    pub user_uuid: String,
    pub store_uuid: String,
    /// Encoded photo evidence (data URL or base64).
    pub photo: String,
    pub validation: bool,
    #[serde(default)]
    pub orders: Vec<OrderLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl EntityModel for Visit {
    const KIND: EntityKind = EntityKind::Visit;

    fn validate(&self) -> DomainResult<()> {
        if self.user_uuid.trim().is_empty() {
            return Err(DomainError::validation("userUuid is required"));
        }
        if self.store_uuid.trim().is_empty() {
            return Err(DomainError::validation("storeUuid is required"));
        }
        if self.photo.trim().is_empty() {
            return Err(DomainError::validation("photo is required"));
        }
        if let Some(line) = self.orders.iter().find(|l| l.quantity < 1) {
            return Err(DomainError::validation(format!(
                "quantity for product {} must be at least 1",
                line.product_uuid
            )));
        }
        if let Some(lat) = self.latitude {
            require_range("latitude", lat, -90.0, 90.0)?;
        }
        if let Some(lng) = self.longitude {
            require_range("longitude", lng, -180.0, 180.0)?;
        }
        Ok(())
    }
}
