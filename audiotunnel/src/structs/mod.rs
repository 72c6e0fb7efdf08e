//! Data structures shared by the pipeline stages and the session.

pub mod buffer;
pub mod channel;
pub mod dts;
pub mod port;
pub mod stream;
pub mod wave;
