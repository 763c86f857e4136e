//! Container formats.

pub mod ts;
