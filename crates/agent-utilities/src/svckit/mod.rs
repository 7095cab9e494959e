//! Service Kit - Utilities
//!
//! Implementations of `agent_core::Utility` registered with the run loop.

mod calc;
mod datetime;
mod service_call;

pub use calc::{CalcUtility, evaluate, format_number};
pub use datetime::DateTimeUtility;
pub use service_call::{ServiceCallConfig, ServiceCallUtility};
