//! CLI command implementations.

pub mod credential;
pub mod legacy;
pub mod rotate;
pub mod status;
