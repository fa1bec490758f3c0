//! HTTP surface of the scheduler.

pub mod endpoint;
