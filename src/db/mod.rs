//! Driver-facing plumbing: connection pooling, query parameters, and value
//! decoding.

pub mod decode;
pub mod params;
pub mod pool;
