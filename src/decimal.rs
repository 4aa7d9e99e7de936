use std::fmt;

use rust_decimal::Decimal;

use crate::error::SqlSessionError;

/// Decimal number that can also hold NaN and the two infinities.
///
/// Plain [`Decimal`] cannot represent non-finite values, so rows expose this type through its own
/// accessor pair ([`Row::get_decimal`](crate::Row::get_decimal)).
///
/// ```rust
/// use rust_decimal::Decimal;
/// use sql_session::DecimalNumber;
///
/// assert!(DecimalNumber::NAN.is_nan());
/// assert!(DecimalNumber::POS_INFINITY.value().is_err());
///
/// let pi = DecimalNumber::of("3.14".parse::<Decimal>().unwrap());
/// assert!(pi.is_finite());
/// assert_eq!(pi.value().unwrap().to_string(), "3.14");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecimalNumber {
    NaN,
    PosInfinity,
    NegInfinity,
    Finite(Decimal),
}

impl DecimalNumber {
    pub const NAN: DecimalNumber = DecimalNumber::NaN;
    pub const POS_INFINITY: DecimalNumber = DecimalNumber::PosInfinity;
    pub const NEG_INFINITY: DecimalNumber = DecimalNumber::NegInfinity;

    #[must_use]
    pub fn of(value: Decimal) -> Self {
        DecimalNumber::Finite(value)
    }

    #[must_use]
    pub fn is_nan(&self) -> bool {
        matches!(self, DecimalNumber::NaN)
    }

    #[must_use]
    pub fn is_pos_infinity(&self) -> bool {
        matches!(self, DecimalNumber::PosInfinity)
    }

    #[must_use]
    pub fn is_neg_infinity(&self) -> bool {
        matches!(self, DecimalNumber::NegInfinity)
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        matches!(self, DecimalNumber::Finite(_))
    }

    /// The finite value.
    ///
    /// # Errors
    /// Returns [`SqlSessionError::ValueAbsent`] for NaN and the infinities.
    pub fn value(&self) -> Result<Decimal, SqlSessionError> {
        match self {
            DecimalNumber::Finite(value) => Ok(*value),
            other => Err(SqlSessionError::ValueAbsent(format!(
                "DecimalNumber value is {}",
                other.kind_name()
            ))),
        }
    }

    /// Parse the textual forms engines use: a decimal literal, `NaN`, `Infinity`, `-Infinity`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "nan" => Some(DecimalNumber::NaN),
            "infinity" | "+infinity" | "inf" | "+inf" => Some(DecimalNumber::PosInfinity),
            "-infinity" | "-inf" => Some(DecimalNumber::NegInfinity),
            _ => trimmed
                .parse::<Decimal>()
                .or_else(|_| Decimal::from_scientific(trimmed))
                .ok()
                .map(DecimalNumber::Finite),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            DecimalNumber::NaN => "NAN",
            DecimalNumber::PosInfinity => "POS_INFINITY",
            DecimalNumber::NegInfinity => "NEG_INFINITY",
            DecimalNumber::Finite(_) => "FINITE",
        }
    }
}

impl From<Decimal> for DecimalNumber {
    fn from(value: Decimal) -> Self {
        DecimalNumber::Finite(value)
    }
}

impl fmt::Display for DecimalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecimalNumber::NaN => f.write_str("NaN"),
            DecimalNumber::PosInfinity => f.write_str("Infinity"),
            DecimalNumber::NegInfinity => f.write_str("-Infinity"),
            DecimalNumber::Finite(value) => write!(f, "{value}"),
        }
    }
}
