// ABOUTME: Root library for the charbridge binary
// ABOUTME: Operator commands, the offline console, and logging setup on top of charbridge-core

pub mod commands;
pub mod console;
pub mod logging;

// Re-export engine modules the binary and tests reach for
pub use charbridge_core::config;
pub use charbridge_core::linger;
pub use charbridge_core::session;
