//! Long-lived process plumbing.

pub mod shutdown;
