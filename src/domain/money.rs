use crate::error::PortalError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A positive monetary amount, as charged for an order or reported by a gateway.
///
/// Wraps `rust_decimal::Decimal` so that comparisons are exact and scale-insensitive
/// (`10.0 == 10.00`), which is what amount matching during reconciliation relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, PortalError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PortalError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Builds an amount from minor currency units (cents), as most gateways report them.
    pub fn from_minor_units(units: i64) -> Result<Self, PortalError> {
        Self::new(Decimal::new(units, 2))
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PortalError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(1.0)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(PortalError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(-1.0)),
            Err(PortalError::ValidationError(_))
        ));
    }

    #[test]
    fn test_amount_equality_ignores_scale() {
        let a = Amount::new(dec!(10.0)).unwrap();
        let b = Amount::new(dec!(10.00)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Amount::new(dec!(9.99)).unwrap());
    }

    #[test]
    fn test_amount_from_minor_units() {
        let amount = Amount::from_minor_units(999).unwrap();
        assert_eq!(amount.value(), dec!(9.99));
        assert!(Amount::from_minor_units(0).is_err());
    }

    #[test]
    fn test_amount_serde_rejects_non_positive() {
        let ok: Amount = serde_json::from_str("\"10.00\"").unwrap();
        assert_eq!(ok.value(), dec!(10));
        assert!(serde_json::from_str::<Amount>("\"-1\"").is_err());
    }
}
