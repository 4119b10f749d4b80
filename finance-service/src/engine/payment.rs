//! Payment recording rules for a single order student.

use super::aggregator::{semester_total, PaymentState};
use crate::models::{MilestoneAmounts, MilestoneKey, PaymentScheme, PaymentStatus};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Largest accepted difference between a milestone payment and the amount
/// the milestone expects.
pub const DEFAULT_PAYMENT_TOLERANCE: Decimal = dec!(1000);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentError {
    #[error("Paid amount cannot be negative")]
    NegativeAmount,
    #[error("Milestone {0} is not payable; use yearly_1, yearly_2, semester_1 or semester_2")]
    UnsupportedMilestone(MilestoneKey),
    #[error("No milestone amounts have been calculated for this student; import fee data first")]
    NoMilestoneAmounts,
    #[error("No amount is due for milestone {0}")]
    NothingDue(MilestoneKey),
    #[error("Amount {received} does not match {expected} due for {key}")]
    AmountMismatch {
        key: MilestoneKey,
        expected: Decimal,
        received: Decimal,
    },
}

impl PaymentError {
    /// Request field the error belongs to.
    pub fn field(&self) -> &'static str {
        match self {
            Self::NegativeAmount => "paid_amount",
            Self::AmountMismatch { .. } => "amount",
            _ => "milestone_key",
        }
    }
}

/// Outcome of an accepted milestone payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedMilestone {
    pub key: MilestoneKey,
    pub expected_amount: Decimal,
    pub received_amount: Decimal,
}

/// Sets the absolute paid amount. A student who was paying by semester
/// leaves that scheme: the per-semester counters no longer describe the
/// paid amount.
pub fn apply_direct_payment(state: &mut PaymentState, paid_amount: Decimal) -> Result<(), PaymentError> {
    if paid_amount < Decimal::ZERO {
        return Err(PaymentError::NegativeAmount);
    }
    if state.payment_scheme_choice == Some(PaymentScheme::Semester) {
        state.payment_scheme_choice = None;
        state.current_milestone_key = None;
        state.semester_1_paid = Decimal::ZERO;
        state.semester_2_paid = Decimal::ZERO;
    }
    state.paid_amount = paid_amount;
    state.settle();
    Ok(())
}

/// Records a payment against one milestone. The received amount must be
/// within `tolerance` of the expected amount; the milestone is then settled
/// at the expected amount.
///
/// `paid_amount` takes the expected amount, not the received one, so a
/// tolerated over- or underpayment still leaves `outstanding = total - paid`
/// at zero. The received amount is returned for the payment history.
pub fn apply_milestone_payment(
    state: &mut PaymentState,
    milestone_amounts: &MilestoneAmounts,
    key: MilestoneKey,
    received: Decimal,
    tolerance: Decimal,
) -> Result<AppliedMilestone, PaymentError> {
    if !key.is_payable() {
        return Err(PaymentError::UnsupportedMilestone(key));
    }
    if milestone_amounts.is_empty() {
        return Err(PaymentError::NoMilestoneAmounts);
    }
    let expected = milestone_amounts.amount_or_zero(&key);
    if expected <= Decimal::ZERO {
        return Err(PaymentError::NothingDue(key));
    }
    if (received - expected).abs() > tolerance {
        return Err(PaymentError::AmountMismatch {
            key,
            expected,
            received,
        });
    }

    match key.scheme {
        PaymentScheme::Yearly => {
            state.payment_scheme_choice = Some(PaymentScheme::Yearly);
            state.current_milestone_key = Some(key);
            state.semester_1_paid = Decimal::ZERO;
            state.semester_2_paid = Decimal::ZERO;
            state.total_amount = expected;
            state.paid_amount = expected;
            state.settle();
        }
        PaymentScheme::Semester => {
            state.payment_scheme_choice = Some(PaymentScheme::Semester);
            if key.number == 1 {
                state.semester_1_paid = expected;
            } else {
                state.semester_2_paid = expected;
            }

            let due_1 = milestone_amounts.amount_or_zero(&MilestoneKey::semester(1));
            let due_2 = milestone_amounts.amount_or_zero(&MilestoneKey::semester(2));
            let met_1 = state.semester_1_paid >= due_1;
            let met_2 = state.semester_2_paid >= due_2;

            state.total_amount = semester_total(milestone_amounts);
            state.paid_amount = state.semester_1_paid + state.semester_2_paid;
            state.outstanding_amount = state.total_amount - state.paid_amount;
            (state.payment_status, state.current_milestone_key) = match (met_1, met_2) {
                (true, true) => (PaymentStatus::Paid, None),
                (false, _) => (PaymentStatus::Partial, Some(MilestoneKey::semester(1))),
                (true, false) => (PaymentStatus::Partial, Some(MilestoneKey::semester(2))),
            };
        }
    }

    Ok(AppliedMilestone {
        key,
        expected_amount: expected,
        received_amount: received,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::aggregator::derive_status;
    use rand::Rng;

    const Y1: MilestoneKey = MilestoneKey::yearly(1);
    const Y2: MilestoneKey = MilestoneKey::yearly(2);
    const S1: MilestoneKey = MilestoneKey::semester(1);
    const S2: MilestoneKey = MilestoneKey::semester(2);

    fn milestones() -> MilestoneAmounts {
        [
            (Y1, dec!(1000000)),
            (Y2, dec!(980000)),
            (S1, dec!(550000)),
            (S2, dec!(520000)),
        ]
        .into_iter()
        .collect()
    }

    fn unpaid(total: Decimal) -> PaymentState {
        let mut state = PaymentState {
            total_amount: total,
            ..PaymentState::default()
        };
        state.settle();
        state
    }

    #[test]
    fn direct_payment_sets_absolute_amount() {
        let mut state = unpaid(dec!(1000));
        apply_direct_payment(&mut state, dec!(400)).unwrap();
        apply_direct_payment(&mut state, dec!(600)).unwrap();
        assert_eq!(state.paid_amount, dec!(600));
        assert_eq!(state.outstanding_amount, dec!(400));
        assert_eq!(state.payment_status, PaymentStatus::Partial);

        apply_direct_payment(&mut state, dec!(1000)).unwrap();
        assert_eq!(state.payment_status, PaymentStatus::Paid);
        assert_eq!(state.outstanding_amount, Decimal::ZERO);
    }

    #[test]
    fn direct_payment_rejects_negative() {
        let mut state = unpaid(dec!(1000));
        let err = apply_direct_payment(&mut state, dec!(-1)).unwrap_err();
        assert_eq!(err, PaymentError::NegativeAmount);
        assert_eq!(err.field(), "paid_amount");
        assert_eq!(state, unpaid(dec!(1000)));
    }

    #[test]
    fn direct_payment_leaves_semester_scheme() {
        let mut state = unpaid(dec!(1070000));
        apply_milestone_payment(&mut state, &milestones(), S1, dec!(550000), DEFAULT_PAYMENT_TOLERANCE)
            .unwrap();
        apply_direct_payment(&mut state, dec!(700000)).unwrap();
        assert_eq!(state.payment_scheme_choice, None);
        assert_eq!(state.semester_1_paid, Decimal::ZERO);
        assert_eq!(state.current_milestone_key, None);
        assert_eq!(state.paid_amount, dec!(700000));
    }

    #[test]
    fn yearly_payment_settles_the_order() {
        let mut state = unpaid(dec!(1000000));
        let applied =
            apply_milestone_payment(&mut state, &milestones(), Y2, dec!(980500), DEFAULT_PAYMENT_TOLERANCE)
                .unwrap();
        assert_eq!(applied.expected_amount, dec!(980000));
        assert_eq!(applied.received_amount, dec!(980500));
        assert_eq!(state.payment_scheme_choice, Some(PaymentScheme::Yearly));
        assert_eq!(state.current_milestone_key, Some(Y2));
        assert_eq!(state.total_amount, dec!(980000));
        assert_eq!(state.paid_amount, dec!(980000));
        assert_eq!(state.outstanding_amount, Decimal::ZERO);
        assert_eq!(state.payment_status, PaymentStatus::Paid);
    }

    #[test]
    fn semester_flow_partial_then_paid() {
        let mut state = unpaid(dec!(1000000));
        let amounts = milestones();

        apply_milestone_payment(&mut state, &amounts, S1, dec!(550000), DEFAULT_PAYMENT_TOLERANCE).unwrap();
        assert_eq!(state.payment_scheme_choice, Some(PaymentScheme::Semester));
        assert_eq!(state.total_amount, dec!(1070000));
        assert_eq!(state.paid_amount, dec!(550000));
        assert_eq!(state.outstanding_amount, dec!(520000));
        assert_eq!(state.payment_status, PaymentStatus::Partial);
        assert_eq!(state.current_milestone_key, Some(S2));

        apply_milestone_payment(&mut state, &amounts, S2, dec!(520000), DEFAULT_PAYMENT_TOLERANCE).unwrap();
        assert_eq!(state.paid_amount, dec!(1070000));
        assert_eq!(state.outstanding_amount, Decimal::ZERO);
        assert_eq!(state.payment_status, PaymentStatus::Paid);
        assert_eq!(state.current_milestone_key, None);
    }

    #[test]
    fn semester_order_does_not_change_the_result() {
        let amounts = milestones();
        let mut forward = unpaid(dec!(1000000));
        apply_milestone_payment(&mut forward, &amounts, S1, dec!(550400), DEFAULT_PAYMENT_TOLERANCE).unwrap();
        apply_milestone_payment(&mut forward, &amounts, S2, dec!(519800), DEFAULT_PAYMENT_TOLERANCE).unwrap();

        let mut reverse = unpaid(dec!(1000000));
        apply_milestone_payment(&mut reverse, &amounts, S2, dec!(519800), DEFAULT_PAYMENT_TOLERANCE).unwrap();
        apply_milestone_payment(&mut reverse, &amounts, S1, dec!(550400), DEFAULT_PAYMENT_TOLERANCE).unwrap();

        assert_eq!(reverse.payment_status, PaymentStatus::Paid);
        assert_eq!(reverse.paid_amount, dec!(1070000));
        assert_eq!(reverse, forward);
    }

    #[test]
    fn second_semester_first_points_back_to_first() {
        let mut state = unpaid(dec!(1000000));
        apply_milestone_payment(&mut state, &milestones(), S2, dec!(520000), DEFAULT_PAYMENT_TOLERANCE)
            .unwrap();
        assert_eq!(state.current_milestone_key, Some(S1));
        assert_eq!(state.payment_status, PaymentStatus::Partial);
    }

    #[test]
    fn missing_second_semester_counts_as_met() {
        let amounts: MilestoneAmounts = [(S1, dec!(600))].into_iter().collect();
        let mut state = unpaid(dec!(600));
        apply_milestone_payment(&mut state, &amounts, S1, dec!(600), DEFAULT_PAYMENT_TOLERANCE).unwrap();
        assert_eq!(state.payment_status, PaymentStatus::Paid);
        assert_eq!(state.total_amount, dec!(600));
    }

    #[test]
    fn rejects_out_of_tolerance_amount() {
        let mut state = unpaid(dec!(1000000));
        let before = state.clone();
        let err = apply_milestone_payment(&mut state, &milestones(), Y1, dec!(998999), DEFAULT_PAYMENT_TOLERANCE)
            .unwrap_err();
        assert!(matches!(err, PaymentError::AmountMismatch { expected, .. } if expected == dec!(1000000)));
        assert_eq!(err.field(), "amount");
        assert_eq!(state, before);

        apply_milestone_payment(&mut state, &milestones(), Y1, dec!(999000), DEFAULT_PAYMENT_TOLERANCE).unwrap();
        assert_eq!(state.payment_status, PaymentStatus::Paid);
    }

    #[test]
    fn rejects_unknown_or_empty_milestones() {
        let mut state = unpaid(dec!(10));
        assert_eq!(
            apply_milestone_payment(&mut state, &milestones(), MilestoneKey::yearly(3), dec!(1), dec!(0)),
            Err(PaymentError::UnsupportedMilestone(MilestoneKey::yearly(3)))
        );
        assert_eq!(
            apply_milestone_payment(&mut state, &MilestoneAmounts::new(), Y1, dec!(1), dec!(0)),
            Err(PaymentError::NoMilestoneAmounts)
        );
        let only_yearly: MilestoneAmounts = [(Y1, dec!(10))].into_iter().collect();
        assert_eq!(
            apply_milestone_payment(&mut state, &only_yearly, S1, dec!(10), dec!(0)),
            Err(PaymentError::NothingDue(S1))
        );
    }

    #[test]
    fn random_payment_sequences_keep_state_consistent() {
        let mut rng = rand::thread_rng();
        let keys = [Y1, Y2, S1, S2];
        for _ in 0..200 {
            let amounts: MilestoneAmounts = keys
                .iter()
                .map(|k| (*k, Decimal::from(rng.gen_range(1..3_000_000i64))))
                .collect();
            let mut state = unpaid(amounts.amount_or_zero(&Y1));

            for _ in 0..6 {
                if rng.gen_bool(0.3) {
                    let paid = Decimal::from(rng.gen_range(0..4_000_000i64));
                    apply_direct_payment(&mut state, paid).unwrap();
                } else {
                    let key = keys[rng.gen_range(0..keys.len())];
                    let due = amounts.amount_or_zero(&key);
                    let offset = Decimal::from(rng.gen_range(-2000..=2000i64));
                    let result = apply_milestone_payment(
                        &mut state,
                        &amounts,
                        key,
                        due + offset,
                        DEFAULT_PAYMENT_TOLERANCE,
                    );
                    assert_eq!(result.is_ok(), offset.abs() <= DEFAULT_PAYMENT_TOLERANCE);
                }

                assert_eq!(state.outstanding_amount, state.total_amount - state.paid_amount);
                assert_eq!(
                    state.payment_status,
                    derive_status(state.total_amount, state.paid_amount)
                );
                if state.payment_scheme_choice == Some(PaymentScheme::Semester) {
                    assert_eq!(state.paid_amount, state.semester_1_paid + state.semester_2_paid);
                }
            }
        }
    }
}
