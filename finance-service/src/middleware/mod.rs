pub mod caller;

pub use caller::{AdminCaller, CallerContext};
