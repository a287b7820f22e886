//! Fixed two-decimal currency amounts.
//!
//! Amounts are held as `Decimal` with a scale of two everywhere in the crate. The only place
//! rounding happens is the conversion to and from the payment processor's integer minor units.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serializer;

use crate::errors::ServiceError;

/// Number of decimal places carried by every currency amount
pub const SCALE: u32 = 2;

/// Returns `amount` with exactly two decimal places.
pub fn normalize(amount: Decimal) -> Decimal {
    let mut value = amount.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero);
    value.rescale(SCALE);
    value
}

/// Renders an amount as a plain string with two decimal places (`"20.00"`).
pub fn display(amount: Decimal) -> String {
    normalize(amount).to_string()
}

/// Accepts a caller-supplied amount only if it is positive and already at cent precision.
pub fn parse_amount(amount: Decimal, field: &str) -> Result<Decimal, ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "{} must be greater than zero",
            field
        )));
    }
    if amount.round_dp(SCALE) != amount {
        return Err(ServiceError::ValidationError(format!(
            "{} must not have more than {} decimal places",
            field, SCALE
        )));
    }
    Ok(normalize(amount))
}

/// Converts a decimal amount into processor minor units (cents).
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    let cents = amount.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero)
        * Decimal::ONE_HUNDRED;
    cents.to_i64().ok_or_else(|| {
        ServiceError::ValidationError(format!("amount {} is out of range", amount))
    })
}

/// Converts processor minor units (cents) back into a decimal amount.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, SCALE)
}

/// Serde helper emitting amounts as two-decimal strings.
pub fn serialize_amount<S>(amount: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&display(*amount))
}
