#![forbid(unsafe_code)]

pub mod lease_cli;
