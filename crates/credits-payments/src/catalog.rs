//! Credit Package Catalog
//!
//! Maps package ids to provider variants and credit amounts. Owned by
//! configuration; the checkout builder only reads it.

use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};

/// Checkout environment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckoutEnvironment {
    #[default]
    Production,
    Test,
}

impl CheckoutEnvironment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "test" | "development" | "dev" | "debug" => Self::Test,
            _ => Self::Production,
        }
    }

    pub const fn is_test(self) -> bool {
        matches!(self, Self::Test)
    }
}

/// A purchasable bundle of credits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPackage {
    pub id: String,
    pub name: String,
    pub credits: u32,

    /// Live-mode provider variant
    pub variant_id: String,

    /// Test-mode provider variant, when it differs from the live one
    #[serde(default)]
    pub test_variant_id: Option<String>,

    /// Display price in cents
    #[serde(default)]
    pub price_cents: i64,
}

impl CreditPackage {
    /// Variant to check out in `env`
    pub fn variant_for(&self, env: CheckoutEnvironment) -> &str {
        match (env, &self.test_variant_id) {
            (CheckoutEnvironment::Test, Some(test)) => test,
            _ => &self.variant_id,
        }
    }
}

/// Package lookup table
#[derive(Clone, Debug)]
pub struct PackageCatalog {
    packages: Vec<CreditPackage>,
}

impl Default for PackageCatalog {
    fn default() -> Self {
        Self {
            packages: vec![
                CreditPackage {
                    id: "basic".into(),
                    name: "Basic".into(),
                    credits: 10,
                    variant_id: "basic".into(),
                    test_variant_id: None,
                    price_cents: 500,
                },
                CreditPackage {
                    id: "pro".into(),
                    name: "Pro".into(),
                    credits: 50,
                    variant_id: "pro".into(),
                    test_variant_id: None,
                    price_cents: 2000,
                },
                CreditPackage {
                    id: "ultra".into(),
                    name: "Ultra".into(),
                    credits: 150,
                    variant_id: "ultra".into(),
                    test_variant_id: None,
                    price_cents: 5000,
                },
            ],
        }
    }
}

impl PackageCatalog {
    pub fn new(packages: Vec<CreditPackage>) -> Result<Self> {
        if packages.is_empty() {
            return Err(PaymentError::Config("credit package catalog is empty".into()));
        }
        if let Some(bad) = packages.iter().find(|p| p.credits == 0) {
            return Err(PaymentError::Config(format!(
                "package '{}' grants zero credits",
                bad.id
            )));
        }
        Ok(Self { packages })
    }

    /// Parse a JSON array of packages
    pub fn from_json(json: &str) -> Result<Self> {
        let packages: Vec<CreditPackage> = serde_json::from_str(json)
            .map_err(|e| PaymentError::Config(format!("invalid CREDIT_PACKAGES: {e}")))?;
        Self::new(packages)
    }

    /// Load from `CREDIT_PACKAGES`, falling back to the default catalog
    pub fn from_env() -> Result<Self> {
        match std::env::var("CREDIT_PACKAGES") {
            Ok(json) if !json.trim().is_empty() => Self::from_json(&json),
            _ => Ok(Self::default()),
        }
    }

    pub fn get(&self, id: &str) -> Result<&CreditPackage> {
        self.packages
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| PaymentError::UnknownPackage(id.to_string()))
    }

    pub fn packages(&self) -> &[CreditPackage] {
        &self.packages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog() {
        let catalog = PackageCatalog::default();
        assert_eq!(catalog.get("basic").unwrap().credits, 10);
        assert!(matches!(
            catalog.get("platinum"),
            Err(PaymentError::UnknownPackage(_))
        ));
    }

    #[test]
    fn test_from_json() {
        let catalog = PackageCatalog::from_json(
            r#"[{"id":"starter","name":"Starter","credits":5,"variant_id":"111","test_variant_id":"999"}]"#,
        )
        .unwrap();
        let package = catalog.get("starter").unwrap();
        assert_eq!(package.variant_for(CheckoutEnvironment::Production), "111");
        assert_eq!(package.variant_for(CheckoutEnvironment::Test), "999");
    }

    #[test]
    fn test_zero_credit_package_rejected() {
        let result = PackageCatalog::from_json(
            r#"[{"id":"free","name":"Free","credits":0,"variant_id":"1"}]"#,
        );
        assert!(matches!(result, Err(PaymentError::Config(_))));
    }

    #[test]
    fn test_environment_parsing() {
        assert!(CheckoutEnvironment::from_str("debug").is_test());
        assert!(!CheckoutEnvironment::from_str("production").is_test());
    }
}
