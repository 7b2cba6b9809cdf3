//! Fixed-point hours and money arithmetic.
//!
//! Durations are carried as whole minutes. Hours and amounts are surfaced as
//! [`Decimal`] rounded to two places with banker's rounding.

use rust_decimal::Decimal;

use crate::error::ValidationError;

const MINUTES_PER_HOUR: i64 = 60;

/// Converts minutes to hours with two decimal places.
#[must_use]
pub fn minutes_to_hours(minutes: i64) -> Decimal {
    (Decimal::from(minutes) / Decimal::from(MINUTES_PER_HOUR)).round_dp(2)
}

/// `rate × minutes / 60`, rounded to cents.
pub fn cost_for(rate: Option<Decimal>, minutes: i64) -> Result<Decimal, ValidationError> {
    let Some(rate) = rate else {
        return Ok(Decimal::ZERO);
    };
    rate.checked_mul(Decimal::from(minutes))
        .and_then(|amount| amount.checked_div(Decimal::from(MINUTES_PER_HOUR)))
        .map(|cost| cost.round_dp(2))
        .ok_or_else(|| ValidationError::InvalidAmount {
            field: "cost",
            value: format!("{rate} x {minutes}m"),
        })
}

/// Largest accepted hourly rate or hour override.
const MAX_AMOUNT: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

/// Rejects negative or out-of-range amounts such as rates or hour overrides.
pub fn ensure_amount(field: &'static str, value: Decimal) -> Result<Decimal, ValidationError> {
    if (value.is_sign_negative() && !value.is_zero()) || value > MAX_AMOUNT {
        return Err(ValidationError::InvalidAmount {
            field,
            value: value.to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn minutes_to_hours_rounds_to_two_places() {
        assert_eq!(minutes_to_hours(110), dec("1.83"));
        assert_eq!(minutes_to_hours(90), dec("1.50"));
        assert_eq!(minutes_to_hours(0), Decimal::ZERO);
    }

    #[test]
    fn cost_uses_fixed_point() {
        assert_eq!(cost_for(Some(dec("100.00")), 110).unwrap(), dec("183.33"));
        assert_eq!(cost_for(Some(dec("0.10")), 30).unwrap(), dec("0.05"));
        assert_eq!(cost_for(None, 600).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn cost_rounds_half_to_even() {
        // 0.125 and 0.375 sit exactly on the midpoint.
        assert_eq!(cost_for(Some(dec("0.25")), 30).unwrap(), dec("0.12"));
        assert_eq!(cost_for(Some(dec("0.75")), 30).unwrap(), dec("0.38"));
    }

    #[test]
    fn out_of_range_amounts_rejected() {
        assert!(ensure_amount("hourly rate", dec("-1")).is_err());
        assert!(ensure_amount("hourly rate", dec("0")).is_ok());
        assert!(ensure_amount("hourly rate", MAX_AMOUNT).is_ok());
        assert!(ensure_amount("hourly rate", MAX_AMOUNT + Decimal::ONE).is_err());
        assert!(ensure_amount("hourly rate", Decimal::MAX).is_err());
    }

    #[test]
    fn overflowing_cost_is_an_error() {
        assert!(matches!(
            cost_for(Some(Decimal::MAX), 480),
            Err(ValidationError::InvalidAmount { field: "cost", .. })
        ));
    }
}
