// ABOUTME: Backend implementations.
// ABOUTME: Each backend implements the ChatBackend trait.

pub mod mock;
