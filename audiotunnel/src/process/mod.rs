/// Channel layout negotiation and PCM reordering.
///
/// Provides the [`ChannelRemapper`](remap::ChannelRemapper) that moves each
/// input channel to the renderer's canonical slot for its role.
pub mod remap;

/// DTS frame header search for passthrough streams.
///
/// Provides [`DtsSync`](sync::DtsSync), which locates and validates core
/// frame headers in any of the four wire packings.
pub mod sync;

/// Stage construction, the first-frame reconfiguration handshake and
/// teardown.
pub mod graph;

/// The client-facing [`AudioSession`](session::AudioSession).
pub mod session;
