//! Domain models for finance-service.

#![allow(clippy::should_implement_trait)]

pub mod fee_line;
pub mod finance_student;
pub mod milestone;
pub mod order;
pub mod order_student;

pub use fee_line::{FeeLine, LineType, OrderFeeLine, StudentFeeLine};
pub use finance_student::{FinanceStudent, PaidTuitionStudent, StudentOrderRow};
pub use milestone::{Milestone, MilestoneAmounts, MilestoneKey, PaymentScheme};
pub use order::{
    FinanceOrder, NewFeeLine, NewMilestone, NewOrder, OrderStatus, OrderStructure, OrderType,
    StructureUpdate, DEFAULT_DEBIT_NOTE_FORM,
};
pub use order_student::{DataStatus, OrderStudent, PaymentKind, PaymentRecord, PaymentStatus};
