//! Utility functions and supporting infrastructure.
//!
//! Provides bitstream I/O, fixed-width byte serialisation, error handling,
//! transfer buffer management and timestamp arithmetic.

pub mod bitstream_io;
pub mod buffer_pool;
pub mod byteorder;
pub mod errors;
pub mod timing;
