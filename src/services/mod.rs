//! Domain services. Each service owns a shared connection pool and publishes
//! [`crate::events::Event`]s after its unit of work commits.

pub mod budget_ledger;
pub mod consolidation;
pub mod contract_ledger;
pub mod deliveries;
pub mod delivery_orders;
pub mod demand_documents;
pub mod identifier_resolver;
pub mod reservations;

use rust_decimal::Decimal;
use validator::ValidationError;

/// Quantities handed to the core must be strictly positive.
pub(crate) fn validate_positive_quantity(value: &Decimal) -> Result<(), ValidationError> {
    if *value <= Decimal::ZERO {
        let mut err = ValidationError::new("positive_quantity");
        err.message = Some(format!("quantity must be greater than zero, got {}", value).into());
        return Err(err);
    }
    Ok(())
}

/// Delivered quantities and prices may be zero but never negative.
pub(crate) fn validate_non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        let mut err = ValidationError::new("non_negative");
        err.message = Some(format!("value must not be negative, got {}", value).into());
        return Err(err);
    }
    Ok(())
}

/// Money columns keep two decimal places.
pub(crate) fn money(value: Decimal) -> Decimal {
    value.round_dp(2)
}
