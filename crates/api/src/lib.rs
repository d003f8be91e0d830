//! Dispatcher process and its admin HTTP surface.

pub mod app;
pub mod middleware;
