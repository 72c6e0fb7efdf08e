#![doc = include_str!("../README.md")]
//!
//! ## Technical Overview
//!
//! Audio output through a tunneled decode/render pipeline.
//!
//! ### Topology
//!
//! ```text
//!  client --transfer buffers--> [decoder] ==tunnel==> [renderer] <==tunnel== [clock]
//! ```
//!
//! The decoder owns a fixed pool of transfer buffers. The client fills one,
//! hands it over and gets it back once the decoder has consumed it, so a
//! full pool is the only backpressure. The renderer presents what the
//! decoder produces against the media clock, which may be owned by the
//! pipeline or shared with a video path.
//!
//! ### Formats
//!
//! - PCM, 8 to 32 bits, up to 8 channels. Caller layouts are reordered into
//!   the canonical slot order
//!   `FL FR BL BR FC LFE SL SR`.
//! - DTS passthrough. Frame boundaries are found in 16-bit and 14-bit
//!   packings of either byte order before anything reaches the decoder.
//! - Dolby Digital / Dolby Digital Plus passthrough.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use audiotunnel::process::session::{AudioSession, SessionConfig};
//! use audiotunnel::stage::soft::SoftBackend;
//! use audiotunnel::structs::stream::StreamHints;
//!
//! let backend = Arc::new(SoftBackend::default());
//! let mut session = AudioSession::new(backend, SessionConfig::default());
//!
//! // 48 kHz stereo, 16 bit
//! session.initialize(&StreamHints::default(), None)?;
//!
//! let pcm = vec![0u8; session.get_chunk_len()];
//! let consumed = session.add_packets(&pcm, None, Some(0))?;
//! assert_eq!(consumed, pcm.len());
//!
//! session.deinitialize();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Pipeline processing.
///
/// 1. **Remapping** ([`process::remap`]): Canonical channel ordering.
/// 2. **Sync** ([`process::sync`]): DTS header detection.
/// 3. **Graph** ([`process::graph`]): Stage and tunnel management.
/// 4. **Session** ([`process::session`]): Client API.
pub mod process;

/// Stage abstraction, tunnels and the software stage implementations.
pub mod stage;

/// Data structures shared across the pipeline.
///
/// - **Buffers** ([`structs::buffer`]): Transfer buffers and their flags
/// - **Channels** ([`structs::channel`]): Channel roles and layouts
/// - **DTS** ([`structs::dts`]): Core frame header decoding
/// - **Ports** ([`structs::port`]): Port definitions and stage parameters
/// - **Streams** ([`structs::stream`]): Stream hints and negotiated parameters
/// - **Wave** ([`structs::wave`]): WAVEFORMATEXTENSIBLE descriptor
pub mod structs;

/// Utility functions and supporting infrastructure.
///
/// - **Bitstream I/O** ([`utils::bitstream_io`]): Bit-level reading and 14-bit packing
/// - **Byte Order** ([`utils::byteorder`]): Fixed-width serialisation
/// - **Error Handling** ([`utils::errors`]): Error types
/// - **Timing** ([`utils::timing`]): Timestamp arithmetic
/// - **Buffer Management** ([`utils::buffer_pool`]): Transfer buffer pool
pub mod utils;
