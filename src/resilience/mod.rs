//! Resilience helpers for backend access.

pub mod retry;
