#![forbid(unsafe_code)]

pub mod common;
pub mod lease;
pub mod reclaim;

pub use common::{saturating_millis, ContractViolation, MonotonicTimeNs, ReasonCodeId, Validate};
