//! Monetary amounts.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Currency applied when none is given.
pub const DEFAULT_CURRENCY: &str = "USD";

/// An amount of money: a decimal string and a 3-letter currency code.
///
/// The currency is normalized once, when the value is created or decoded: an
/// empty currency becomes [`DEFAULT_CURRENCY`]. Normalizing an already
/// normalized value changes nothing, so decoding the same message twice
/// yields the same `Money`.
///
/// # Example
///
/// ```
/// use tickets::entities::Money;
///
/// let price: Money = serde_json::from_str(r#"{"amount":"50.00","currency":""}"#).unwrap();
/// assert_eq!(price.currency(), "USD");
/// assert_eq!(price, Money::new("50.00", "USD"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    amount: String,
    #[serde(default = "default_currency", deserialize_with = "deserialize_currency")]
    currency: String,
}

impl Money {
    /// Create an amount, defaulting an empty currency to `USD`.
    #[must_use]
    pub fn new(amount: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            amount: amount.into(),
            currency: normalize_currency(currency.into()),
        }
    }

    /// The decimal amount, as given.
    #[must_use]
    pub fn amount(&self) -> &str {
        &self.amount
    }

    /// The currency code.
    #[must_use]
    pub fn currency(&self) -> &str {
        &self.currency
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

fn normalize_currency(currency: String) -> String {
    if currency.trim().is_empty() {
        DEFAULT_CURRENCY.to_string()
    } else {
        currency
    }
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn deserialize_currency<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let currency = Option::<String>::deserialize(deserializer)?;
    Ok(normalize_currency(currency.unwrap_or_default()))
}
