//! # Money Module
//!
//! `Money` holds rupee amounts as integer paise, and `GstRate` holds GST
//! slabs in basis points. Snapshot payloads carry both as plain integers.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Integer paise                                                          │
//! │                                                                         │
//! │    MRP ₹12.50  ──►  Money(1250)                                         │
//! │    GST 12%     ──►  GstRate(1200)                                       │
//! │                                                                         │
//! │    gst = (1250 × 1200) / 10000 = 150 paise, rounded half-to-even        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use pharma_core::money::{GstRate, Money};
//!
//! let mrp = Money::from_paise(1250);
//! assert_eq!(mrp.gst_on(GstRate::GST_12).paise(), 150);
//! assert_eq!(mrp.to_string(), "₹12.50");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};
use ts_rs::TS;

// =============================================================================
// GST Rate
// =============================================================================

/// GST rate in basis points (1200 = 12%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct GstRate(u32);

impl GstRate {
    pub const EXEMPT: GstRate = GstRate(0);
    pub const GST_5: GstRate = GstRate(500);
    pub const GST_12: GstRate = GstRate(1200);
    pub const GST_18: GstRate = GstRate(1800);
    pub const GST_28: GstRate = GstRate(2800);

    /// The slabs a pharmacy bill can legally carry.
    pub const SLABS: [GstRate; 5] = [
        GstRate::EXEMPT,
        GstRate::GST_5,
        GstRate::GST_12,
        GstRate::GST_18,
        GstRate::GST_28,
    ];

    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        GstRate(bps)
    }

    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// Whether this rate is one of the published slabs.
    pub fn is_standard_slab(&self) -> bool {
        GstRate::SLABS.contains(self)
    }

    /// CGST and SGST each carry half of an intra-state rate.
    pub const fn split_intra_state(&self) -> (GstRate, GstRate) {
        let half = self.0 / 2;
        (GstRate(half), GstRate(self.0 - half))
    }
}

impl fmt::Display for GstRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 100 == 0 {
            write!(f, "{}%", self.0 / 100)
        } else {
            write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
        }
    }
}

// =============================================================================
// Money Type
// =============================================================================

/// A rupee amount in paise. Signed so returns and credit notes fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Money(i64);

impl Money {
    #[inline]
    pub const fn from_paise(paise: i64) -> Self {
        Money(paise)
    }

    /// Builds an amount from rupees and paise. Only `rupees` carries the sign.
    #[inline]
    pub const fn from_rupees(rupees: i64, paise: i64) -> Self {
        if rupees < 0 {
            Money(rupees * 100 - paise)
        } else {
            Money(rupees * 100 + paise)
        }
    }

    #[inline]
    pub const fn paise(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub const fn multiply_quantity(&self, qty: i64) -> Self {
        Money(self.0 * qty)
    }

    /// GST on this amount, rounded half-to-even to the nearest paisa.
    pub fn gst_on(&self, rate: GstRate) -> Money {
        Money(div_round_half_even(
            self.0 as i128 * rate.bps() as i128,
            10_000,
        ))
    }

    /// Reduces the amount by a percentage given in basis points.
    pub fn apply_discount_bps(&self, discount_bps: u32) -> Money {
        let discount = div_round_half_even(self.0 as i128 * discount_bps as i128, 10_000);
        Money(self.0 - discount)
    }
}

fn div_round_half_even(numerator: i128, denominator: i128) -> i64 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    let twice = remainder.abs() * 2;
    let step = if numerator < 0 { -1 } else { 1 };

    let rounded = if twice > denominator || (twice == denominator && quotient % 2 != 0) {
        quotient + step
    } else {
        quotient
    };
    rounded as i64
}

// =============================================================================
// Trait Implementations
// =============================================================================

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{}₹{}.{:02}", sign, (self.0 / 100).abs(), (self.0 % 100).abs())
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

impl Mul<i64> for Money {
    type Output = Self;

    #[inline]
    fn mul(self, qty: i64) -> Self {
        Money(self.0 * qty)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), Add::add)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rupees() {
        assert_eq!(Money::from_rupees(10, 99).paise(), 1099);
        assert_eq!(Money::from_rupees(-5, 50).paise(), -550);
    }

    #[test]
    fn test_display() {
        assert_eq!(Money::from_paise(1099).to_string(), "₹10.99");
        assert_eq!(Money::from_paise(-550).to_string(), "-₹5.50");
        assert_eq!(Money::zero().to_string(), "₹0.00");
    }

    #[test]
    fn test_gst_half_even() {
        // 50 × 5% = 2.5 paise -> 2
        assert_eq!(Money::from_paise(50).gst_on(GstRate::GST_5).paise(), 2);
        // 150 × 5% = 7.5 paise -> 8
        assert_eq!(Money::from_paise(150).gst_on(GstRate::GST_5).paise(), 8);
        // 1000 × 18% = 180 exactly
        assert_eq!(Money::from_paise(1000).gst_on(GstRate::GST_18).paise(), 180);
        // negatives mirror positives
        assert_eq!(Money::from_paise(-150).gst_on(GstRate::GST_5).paise(), -8);
    }

    #[test]
    fn test_discount() {
        let subtotal = Money::from_paise(10_000);
        assert_eq!(subtotal.apply_discount_bps(1000).paise(), 9000);
    }

    #[test]
    fn test_arithmetic_and_sum() {
        let a = Money::from_paise(250);
        let mut b = a + Money::from_paise(50);
        b -= Money::from_paise(100);
        assert_eq!(b.paise(), 200);
        assert_eq!((a * 3).paise(), 750);

        let total: Money = [a, b].into_iter().sum();
        assert_eq!(total.paise(), 450);
    }

    #[test]
    fn test_gst_rate_display_and_split() {
        assert_eq!(GstRate::GST_12.to_string(), "12%");
        assert_eq!(GstRate::from_bps(250).to_string(), "2.50%");
        assert_eq!(
            GstRate::GST_18.split_intra_state(),
            (GstRate::from_bps(900), GstRate::from_bps(900))
        );
        assert!(GstRate::GST_28.is_standard_slab());
        assert!(!GstRate::from_bps(700).is_standard_slab());
    }

    #[test]
    fn test_serializes_as_integers() {
        assert_eq!(serde_json::to_string(&Money::from_paise(1250)).unwrap(), "1250");
        assert_eq!(serde_json::to_string(&GstRate::GST_5).unwrap(), "500");
    }
}
