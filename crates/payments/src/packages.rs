//! Quota package catalog
//!
//! Fixed lookup table from package code to quota units and list price.
//! Credit amounts are always derived from this table at credit time, never
//! trusted from the provider callback.

use crate::error::{PaymentError, PaymentResult};

/// A purchasable quota package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPackage {
    /// Package code as sent by the client (e.g. "5_quota").
    pub code: &'static str,
    /// Quota units credited on successful payment.
    pub units: i64,
    /// List price in the smallest currency unit.
    pub price: i64,
}

const PACKAGES: &[QuotaPackage] = &[
    QuotaPackage {
        code: "1_quota",
        units: 1,
        price: 100_000,
    },
    QuotaPackage {
        code: "3_quota",
        units: 3,
        price: 250_000,
    },
    QuotaPackage {
        code: "5_quota",
        units: 5,
        price: 350_000,
    },
];

/// Look up a package by code.
pub fn find(code: &str) -> Option<QuotaPackage> {
    PACKAGES.iter().copied().find(|p| p.code == code)
}

/// Quota units for a package code, or `InvalidRequest` for unknown codes.
pub fn units_for(code: &str) -> PaymentResult<i64> {
    find(code)
        .map(|p| p.units)
        .ok_or_else(|| PaymentError::InvalidRequest(format!("unknown package code: {}", code)))
}

/// All packages, for listing endpoints.
pub fn all() -> &'static [QuotaPackage] {
    PACKAGES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_quota_package_grants_five_units() {
        let pkg = find("5_quota").unwrap();
        assert_eq!(pkg.units, 5);
        assert_eq!(pkg.price, 350_000);
    }

    #[test]
    fn unknown_code_is_invalid_request() {
        let err = units_for("99_quota").unwrap_err();
        assert!(matches!(err, PaymentError::InvalidRequest(_)));
    }

    #[test]
    fn codes_are_unique() {
        let mut codes: Vec<_> = all().iter().map(|p| p.code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all().len());
    }
}
