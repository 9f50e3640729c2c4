//! HTTP request handlers.

pub mod health;
pub mod tus;

pub use health::*;
pub use tus::*;
