//! Money arithmetic shared by the cart, order and payment views.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::errors::ServiceError;

/// Subtotal, coupon discount and amount due, all at two decimal places
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub subtotal: Decimal,
    /// Coupon percentage applied, 0 when no coupon
    pub discount_percent: i32,
    pub discount_amount: Decimal,
    pub payable_total: Decimal,
}

impl Totals {
    pub fn new(subtotal: Decimal, discount_percent: i32) -> Self {
        let subtotal = round_money(subtotal);
        let percent = discount_percent.clamp(0, 100);
        let discount_amount =
            round_money(subtotal * Decimal::from(percent) / Decimal::ONE_HUNDRED);
        Self {
            subtotal,
            discount_percent: percent,
            discount_amount,
            payable_total: subtotal - discount_amount,
        }
    }

    /// Sums `(unit_price, quantity)` pairs before applying the discount.
    pub fn from_lines<I>(lines: I, discount_percent: i32) -> Self
    where
        I: IntoIterator<Item = (Decimal, i32)>,
    {
        let subtotal = lines
            .into_iter()
            .map(|(price, quantity)| price * Decimal::from(quantity))
            .sum();
        Self::new(subtotal, discount_percent)
    }

    /// Payable total in the provider's minor unit (cents, kobo).
    pub fn payable_minor_units(&self) -> Result<i64, ServiceError> {
        to_minor_units(self.payable_total)
    }
}

/// Rounds half away from zero and fixes the scale at two places.
pub fn round_money(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded
}

pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| ServiceError::InternalError(format!("amount {} out of range", amount)))
}
