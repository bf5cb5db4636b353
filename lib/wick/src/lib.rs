//! Shared support for the zigcat crates: logging facade and wall-clock helpers.

pub mod logging;
pub mod time;
