//! Turns a student's evaluated fee lines into the order-level milestone
//! amounts, a single headline total and the data-completeness flag.

use crate::models::{DataStatus, FeeLine, LineType, MilestoneAmounts};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalSource {
    TotalLine,
    ItemSum,
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The total line's amounts; empty when the total came from the item-sum
    /// fallback or nothing was resolvable.
    pub milestone_amounts: MilestoneAmounts,
    pub total_amount: Decimal,
    pub source: TotalSource,
    pub data_status: DataStatus,
}

/// Headline amount of a milestone map: the lowest-numbered yearly key, else
/// the first non-zero amount in key order.
pub fn headline_amount(amounts: &MilestoneAmounts) -> Decimal {
    if let Some((_, amount)) = amounts.first_yearly() {
        return amount;
    }
    amounts
        .iter()
        .map(|(_, v)| *v)
        .find(|v| !v.is_zero())
        .unwrap_or(Decimal::ZERO)
}

/// Amount an item contributes to the fallback sum: its yearly amount when it
/// has one, else its first available milestone amount.
fn item_amount(amounts: &MilestoneAmounts) -> Option<Decimal> {
    amounts
        .first_yearly()
        .map(|(_, v)| v)
        .or_else(|| amounts.iter().next().map(|(_, v)| *v))
}

/// Resolves lines that have already been through formula evaluation. When
/// several lines are typed `total`, the last one in debit-note order wins.
///
/// Only input lines (those without a formula) count as data: formula lines
/// always carry a computed map, zeros included, so a student with no input
/// amounts resolves to an empty map and stays pending.
pub fn resolve(lines: &[FeeLine]) -> Resolution {
    let has_input = lines
        .iter()
        .any(|l| !l.has_formula() && !l.amounts.is_empty());
    if !has_input {
        return Resolution {
            milestone_amounts: MilestoneAmounts::new(),
            total_amount: Decimal::ZERO,
            source: TotalSource::Missing,
            data_status: DataStatus::Pending,
        };
    }

    let total_line = lines.iter().rev().find(|l| l.line_type == LineType::Total);
    let total_amounts = total_line.map(|l| l.amounts.clone()).unwrap_or_default();

    let mut total_amount = headline_amount(&total_amounts);
    let mut source = TotalSource::TotalLine;

    if total_amount.is_zero() {
        let item_sum: Decimal = lines
            .iter()
            .filter(|l| l.line_type == LineType::Item)
            .filter_map(|l| {
                item_amount(&l.amounts).map(|v| if l.is_deduction { -v.abs() } else { v })
            })
            .sum();
        total_amount = item_sum;
        source = if item_sum.is_zero() {
            TotalSource::Missing
        } else {
            TotalSource::ItemSum
        };
    }

    Resolution {
        milestone_amounts: total_amounts,
        total_amount,
        source,
        data_status: DataStatus::Complete,
    }
}
