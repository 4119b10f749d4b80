//! Pure calculation rules: formula evaluation, milestone resolution,
//! payment recording and student roll-ups. Nothing here touches the
//! database; [`crate::services::finance`] drives these inside transactions.

pub mod aggregator;
pub mod cascade;
pub mod formula;
pub mod payment;
pub mod resolver;

pub use aggregator::{derive_status, display_status, DisplayStatus, PaymentState};
pub use cascade::{flags_other_tuition_orders, summarize, StudentSummary};
pub use formula::{evaluate_fee_lines, Formula, FormulaError, FormulaFailure, FormulaMode};
pub use payment::{apply_direct_payment, apply_milestone_payment, AppliedMilestone, PaymentError};
pub use resolver::{headline_amount, resolve, Resolution, TotalSource};
