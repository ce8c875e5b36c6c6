//! Shared helpers

mod common;

pub use common::*;
