//! Memory-management primitives shared by every container.

/// Chunked slot arena with deferred reclamation.
pub mod datastore;

/// Reader generation tracking.
pub mod generation;
