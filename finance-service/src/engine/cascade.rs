//! Roll-ups from order students to their finance student.

use super::aggregator::derive_status;
use crate::models::{OrderType, PaymentStatus};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StudentSummary {
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub outstanding_amount: Decimal,
    pub payment_status: PaymentStatus,
}

/// Sums `(total, paid)` pairs of every order row of one finance student.
pub fn summarize<I>(rows: I) -> StudentSummary
where
    I: IntoIterator<Item = (Decimal, Decimal)>,
{
    let (total, paid) = rows
        .into_iter()
        .fold((Decimal::ZERO, Decimal::ZERO), |(t, p), (total, paid)| (t + total, p + paid));
    StudentSummary {
        total_amount: total,
        paid_amount: paid,
        outstanding_amount: total - paid,
        payment_status: derive_status(total, paid),
    }
}

/// Whether a payment on an order should flag the student's other open
/// tuition orders in the same finance year as paid elsewhere.
pub fn flags_other_tuition_orders(order_type: OrderType, status: PaymentStatus) -> bool {
    order_type == OrderType::Tuition && matches!(status, PaymentStatus::Paid | PaymentStatus::Partial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rust_decimal_macros::dec;

    #[test]
    fn sums_all_orders() {
        let summary = summarize(vec![
            (dec!(1000), dec!(1000)),
            (dec!(500), dec!(100)),
            (Decimal::ZERO, Decimal::ZERO),
        ]);
        assert_eq!(summary.total_amount, dec!(1500));
        assert_eq!(summary.paid_amount, dec!(1100));
        assert_eq!(summary.outstanding_amount, dec!(400));
        assert_eq!(summary.payment_status, PaymentStatus::Partial);
    }

    #[test]
    fn no_orders_is_unpaid() {
        let summary = summarize(Vec::new());
        assert_eq!(summary.total_amount, Decimal::ZERO);
        assert_eq!(summary.payment_status, PaymentStatus::Unpaid);
    }

    #[test]
    fn summary_matches_row_sums_for_random_rows() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let rows: Vec<(Decimal, Decimal)> = (0..rng.gen_range(0..8))
                .map(|_| {
                    let total = rng.gen_range(0..2_000_000i64);
                    (Decimal::from(total), Decimal::from(rng.gen_range(0..=total)))
                })
                .collect();
            let total: Decimal = rows.iter().map(|r| r.0).sum();
            let paid: Decimal = rows.iter().map(|r| r.1).sum();

            let summary = summarize(rows);
            assert_eq!(summary.total_amount, total);
            assert_eq!(summary.paid_amount, paid);
            assert_eq!(summary.outstanding_amount, total - paid);
            assert_eq!(summary.payment_status, derive_status(total, paid));
        }
    }

    #[test]
    fn only_tuition_payments_flag() {
        assert!(flags_other_tuition_orders(OrderType::Tuition, PaymentStatus::Paid));
        assert!(flags_other_tuition_orders(OrderType::Tuition, PaymentStatus::Partial));
        assert!(!flags_other_tuition_orders(OrderType::Tuition, PaymentStatus::Unpaid));
        assert!(!flags_other_tuition_orders(OrderType::Service, PaymentStatus::Paid));
    }
}
