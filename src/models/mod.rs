//! Domain model module declarations.

pub mod block;
pub mod session;
