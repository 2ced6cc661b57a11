#![forbid(unsafe_code)]

pub mod lease_state;
pub mod readiness;
pub mod reclaim;
