//! Per-order-student payment state and status derivation.

use super::resolver::Resolution;
use crate::models::{MilestoneAmounts, MilestoneKey, OrderStudent, PaymentScheme, PaymentStatus};
use rust_decimal::Decimal;

/// Stored status from a total and a paid amount.
pub fn derive_status(total: Decimal, paid: Decimal) -> PaymentStatus {
    if total > Decimal::ZERO && paid >= total {
        PaymentStatus::Paid
    } else if paid.is_zero() {
        PaymentStatus::Unpaid
    } else {
        PaymentStatus::Partial
    }
}

/// Status shown on read paths, where an order with nothing to pay is
/// distinguished from an unpaid one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    NoFee,
    Unpaid,
    Partial,
    Paid,
}

pub fn display_status(total: Decimal, paid: Decimal) -> DisplayStatus {
    if total.is_zero() {
        return DisplayStatus::NoFee;
    }
    match derive_status(total, paid) {
        PaymentStatus::Paid => DisplayStatus::Paid,
        PaymentStatus::Partial => DisplayStatus::Partial,
        PaymentStatus::Unpaid => DisplayStatus::Unpaid,
    }
}

/// The mutable money fields of an order student.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentState {
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub outstanding_amount: Decimal,
    pub payment_status: PaymentStatus,
    pub payment_scheme_choice: Option<PaymentScheme>,
    pub current_milestone_key: Option<MilestoneKey>,
    pub semester_1_paid: Decimal,
    pub semester_2_paid: Decimal,
}

impl Default for PaymentState {
    fn default() -> Self {
        Self {
            total_amount: Decimal::ZERO,
            paid_amount: Decimal::ZERO,
            outstanding_amount: Decimal::ZERO,
            payment_status: PaymentStatus::Unpaid,
            payment_scheme_choice: None,
            current_milestone_key: None,
            semester_1_paid: Decimal::ZERO,
            semester_2_paid: Decimal::ZERO,
        }
    }
}

impl PaymentState {
    pub fn from_student(student: &OrderStudent) -> Self {
        Self {
            total_amount: student.total_amount,
            paid_amount: student.paid_amount,
            outstanding_amount: student.outstanding_amount,
            payment_status: student.parsed_payment_status(),
            payment_scheme_choice: student.scheme_choice(),
            current_milestone_key: student.current_milestone(),
            semester_1_paid: student.semester_1_paid,
            semester_2_paid: student.semester_2_paid,
        }
    }

    pub fn apply_to(&self, student: &mut OrderStudent) {
        student.total_amount = self.total_amount;
        student.paid_amount = self.paid_amount;
        student.outstanding_amount = self.outstanding_amount;
        student.payment_status = self.payment_status.as_str().to_string();
        student.payment_scheme_choice = self.payment_scheme_choice.map(|s| s.as_str().to_string());
        student.current_milestone_key = self.current_milestone_key.map(|k| k.to_string());
        student.semester_1_paid = self.semester_1_paid;
        student.semester_2_paid = self.semester_2_paid;
    }

    /// Recomputes outstanding and status from total and paid.
    pub fn settle(&mut self) {
        self.outstanding_amount = self.total_amount - self.paid_amount;
        self.payment_status = derive_status(self.total_amount, self.paid_amount);
    }

    /// Takes a freshly resolved total. Students paying by semester keep the
    /// semester-sum total so their paid amount stays comparable. A zero
    /// resolution leaves the previous total in place.
    pub fn apply_resolution(&mut self, resolution: &Resolution) {
        let total = match self.payment_scheme_choice {
            Some(PaymentScheme::Semester) => semester_total(&resolution.milestone_amounts),
            _ => resolution.total_amount,
        };
        if total.is_zero() {
            return;
        }
        self.total_amount = total;
        self.settle();
    }
}

pub(crate) fn semester_total(amounts: &MilestoneAmounts) -> Decimal {
    amounts.amount_or_zero(&MilestoneKey::semester(1)) + amounts.amount_or_zero(&MilestoneKey::semester(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::resolver::TotalSource;
    use crate::models::DataStatus;
    use rand::Rng;
    use rust_decimal_macros::dec;

    fn resolution(pairs: &[(MilestoneKey, Decimal)], total: Decimal) -> Resolution {
        Resolution {
            milestone_amounts: pairs.iter().copied().collect(),
            total_amount: total,
            source: TotalSource::TotalLine,
            data_status: DataStatus::Complete,
        }
    }

    #[test]
    fn status_rules() {
        assert_eq!(derive_status(dec!(100), dec!(100)), PaymentStatus::Paid);
        assert_eq!(derive_status(dec!(100), dec!(150)), PaymentStatus::Paid);
        assert_eq!(derive_status(dec!(100), dec!(40)), PaymentStatus::Partial);
        assert_eq!(derive_status(dec!(100), Decimal::ZERO), PaymentStatus::Unpaid);
        assert_eq!(derive_status(Decimal::ZERO, Decimal::ZERO), PaymentStatus::Unpaid);
        assert_eq!(derive_status(Decimal::ZERO, dec!(5)), PaymentStatus::Partial);
    }

    #[test]
    fn display_status_marks_no_fee() {
        assert_eq!(display_status(Decimal::ZERO, Decimal::ZERO), DisplayStatus::NoFee);
        assert_eq!(display_status(dec!(10), dec!(10)), DisplayStatus::Paid);
        assert_eq!(
            serde_json::to_value(DisplayStatus::NoFee).unwrap(),
            serde_json::json!("no_fee")
        );
    }

    #[test]
    fn settle_holds_for_random_amounts() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let total = Decimal::from(rng.gen_range(0..5_000_000i64));
            let paid = Decimal::from(rng.gen_range(0..6_000_000i64));
            let mut state = PaymentState {
                total_amount: total,
                paid_amount: paid,
                ..PaymentState::default()
            };
            state.settle();

            assert_eq!(state.outstanding_amount, total - paid);
            let expected = if paid >= total && total > Decimal::ZERO {
                PaymentStatus::Paid
            } else if paid.is_zero() {
                PaymentStatus::Unpaid
            } else {
                PaymentStatus::Partial
            };
            assert_eq!(state.payment_status, expected, "total={total} paid={paid}");
        }
    }

    #[test]
    fn resolution_updates_total_and_status() {
        let mut state = PaymentState {
            paid_amount: dec!(300),
            ..PaymentState::default()
        };
        state.apply_resolution(&resolution(&[(MilestoneKey::yearly(1), dec!(1000))], dec!(1000)));
        assert_eq!(state.total_amount, dec!(1000));
        assert_eq!(state.outstanding_amount, dec!(700));
        assert_eq!(state.payment_status, PaymentStatus::Partial);
    }

    #[test]
    fn zero_resolution_keeps_previous_total() {
        let mut state = PaymentState {
            total_amount: dec!(800),
            outstanding_amount: dec!(800),
            ..PaymentState::default()
        };
        state.apply_resolution(&resolution(&[], Decimal::ZERO));
        assert_eq!(state.total_amount, dec!(800));
    }

    #[test]
    fn semester_payers_keep_semester_total() {
        let mut state = PaymentState {
            payment_scheme_choice: Some(PaymentScheme::Semester),
            semester_1_paid: dec!(550),
            paid_amount: dec!(550),
            ..PaymentState::default()
        };
        state.apply_resolution(&resolution(
            &[
                (MilestoneKey::yearly(1), dec!(1000)),
                (MilestoneKey::semester(1), dec!(550)),
                (MilestoneKey::semester(2), dec!(560)),
            ],
            dec!(1000),
        ));
        assert_eq!(state.total_amount, dec!(1110));
        assert_eq!(state.outstanding_amount, dec!(560));
        assert_eq!(state.payment_status, PaymentStatus::Partial);
    }
}
