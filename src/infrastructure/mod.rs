//! Infrastructure layer - Backend implementations and process setup

pub mod cache;
pub mod logging;
