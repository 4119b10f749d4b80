//! Milestone keys and the per-key amount maps that flow through fee lines,
//! order students and payments.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Payment Scheme
// ============================================================================

/// How a student pays an order. `Yearly` sorts before `Semester` so milestone
/// maps iterate yearly keys first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentScheme {
    Yearly,
    Semester,
}

impl PaymentScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yearly => "yearly",
            Self::Semester => "semester",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "yearly" => Some(Self::Yearly),
            "semester" => Some(Self::Semester),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Milestone Key
// ============================================================================

/// `<scheme>_<n>` identifier of a payment milestone, e.g. `yearly_1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MilestoneKey {
    pub scheme: PaymentScheme,
    pub number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid milestone key '{0}', expected <yearly|semester>_<n>")]
pub struct InvalidMilestoneKey(pub String);

impl MilestoneKey {
    pub const fn new(scheme: PaymentScheme, number: u32) -> Self {
        Self { scheme, number }
    }

    pub const fn yearly(number: u32) -> Self {
        Self::new(PaymentScheme::Yearly, number)
    }

    pub const fn semester(number: u32) -> Self {
        Self::new(PaymentScheme::Semester, number)
    }

    /// Keys accepted by the milestone payment recorder.
    pub fn is_payable(&self) -> bool {
        matches!(self.number, 1 | 2)
    }
}

impl fmt::Display for MilestoneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.scheme, self.number)
    }
}

impl FromStr for MilestoneKey {
    type Err = InvalidMilestoneKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidMilestoneKey(s.to_string());
        let (scheme, number) = s.trim().rsplit_once('_').ok_or_else(invalid)?;
        let scheme = PaymentScheme::parse(scheme).ok_or_else(invalid)?;
        let number: u32 = number.parse().map_err(|_| invalid())?;
        if number == 0 {
            return Err(invalid());
        }
        Ok(Self::new(scheme, number))
    }
}

impl Serialize for MilestoneKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MilestoneKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

// ============================================================================
// Milestone Amounts
// ============================================================================

/// Amount per milestone key. Absent keys mean "no amount"; readers that need
/// a number treat them as zero via [`MilestoneAmounts::amount_or_zero`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MilestoneAmounts(BTreeMap<MilestoneKey, Decimal>);

impl MilestoneAmounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &MilestoneKey) -> Option<Decimal> {
        self.0.get(key).copied()
    }

    pub fn amount_or_zero(&self, key: &MilestoneKey) -> Decimal {
        self.get(key).unwrap_or(Decimal::ZERO)
    }

    pub fn insert(&mut self, key: MilestoneKey, amount: Decimal) {
        self.0.insert(key, amount);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Entries in key order: yearly keys first, each scheme by ascending number.
    pub fn iter(&self) -> impl Iterator<Item = (&MilestoneKey, &Decimal)> {
        self.0.iter()
    }

    /// Drops amounts for keys the order no longer defines.
    pub fn retain_keys(&mut self, keys: &[MilestoneKey]) {
        self.0.retain(|k, _| keys.contains(k));
    }

    /// Lowest-numbered yearly key that carries an amount.
    pub fn first_yearly(&self) -> Option<(MilestoneKey, Decimal)> {
        self.0
            .iter()
            .find(|(k, _)| k.scheme == PaymentScheme::Yearly)
            .map(|(k, v)| (*k, *v))
    }
}

impl FromIterator<(MilestoneKey, Decimal)> for MilestoneAmounts {
    fn from_iter<I: IntoIterator<Item = (MilestoneKey, Decimal)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ============================================================================
// Order Milestone
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Milestone {
    pub milestone_id: Uuid,
    pub order_id: Uuid,
    pub payment_scheme: String,
    pub milestone_number: i32,
    pub title: String,
    pub deadline_date: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
}

impl Milestone {
    /// Rows with an unrecognised scheme are read as yearly.
    pub fn key(&self) -> MilestoneKey {
        let scheme = PaymentScheme::parse(&self.payment_scheme).unwrap_or(PaymentScheme::Yearly);
        let number = u32::try_from(self.milestone_number).unwrap_or(0);
        MilestoneKey::new(scheme, number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn key_parses_and_displays() {
        let key: MilestoneKey = "semester_2".parse().unwrap();
        assert_eq!(key, MilestoneKey::semester(2));
        assert_eq!(key.to_string(), "semester_2");
    }

    #[test]
    fn key_rejects_garbage() {
        for raw in ["", "yearly", "monthly_1", "yearly_0", "yearly_x", "semester_-1"] {
            assert!(raw.parse::<MilestoneKey>().is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn only_first_two_milestones_are_payable() {
        assert!(MilestoneKey::yearly(1).is_payable());
        assert!(MilestoneKey::semester(2).is_payable());
        assert!(!MilestoneKey::yearly(3).is_payable());
    }

    #[test]
    fn yearly_keys_sort_first() {
        let amounts: MilestoneAmounts = [
            (MilestoneKey::semester(1), dec!(50)),
            (MilestoneKey::yearly(2), dec!(90)),
            (MilestoneKey::yearly(1), dec!(100)),
        ]
        .into_iter()
        .collect();
        let keys: Vec<String> = amounts.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["yearly_1", "yearly_2", "semester_1"]);
        assert_eq!(amounts.first_yearly(), Some((MilestoneKey::yearly(1), dec!(100))));
    }

    #[test]
    fn amounts_round_trip_through_json_object() {
        let json = serde_json::json!({ "yearly_1": "1000", "semester_1": 600 });
        let amounts: MilestoneAmounts = serde_json::from_value(json).unwrap();
        assert_eq!(amounts.get(&MilestoneKey::yearly(1)), Some(dec!(1000)));
        assert_eq!(amounts.get(&MilestoneKey::semester(1)), Some(dec!(600)));
        assert_eq!(amounts.amount_or_zero(&MilestoneKey::semester(2)), Decimal::ZERO);

        let back = serde_json::to_value(&amounts).unwrap();
        assert_eq!(back["yearly_1"], "1000");
    }
}
