/// Common test utilities and fake collaborators
///
/// This module provides shared functionality for integration tests including:
/// - An in-memory state provider that records restores
/// - Recovery actions with switchable outcomes and call counters
/// - Sinks that record what the engine told them
pub mod fakes;
pub mod test_helpers;
