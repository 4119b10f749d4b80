pub mod database;
pub mod fee_sheet;
pub mod finance;
pub mod metrics;

pub use database::{Database, OrderStudentFilter};
pub use finance::FinanceService;
pub use metrics::{get_metrics, init_metrics};
