//! Shared primitives for the mirror workspace: the content digest type,
//! the chunk/tree geometry, and the observability event schema.

pub mod digest;
pub mod events;
pub mod shape;

pub use digest::{Digest, InvalidDigest, DIGEST_SIZE};
pub use events::{Event, EventSink, NullSink, TracingSink};
pub use shape::{Shape, ShapeError};
