//! Reordering of interleaved PCM into the renderer's canonical slot order.

use log::{debug, warn};

use crate::structs::channel::{CANONICAL_ROLES, ChannelLayout, ChannelRole, MAX_CHANNELS};

/// Linear gain for a level in millibels.
#[inline]
pub fn gain_from_millibels(millibels: i32) -> f32 {
    10f32.powf(millibels as f32 / 2000.0)
}

/// Scales little-endian signed 16-bit samples in place, saturating at the
/// sample range.
pub fn scale_s16_le(samples: &mut [u8], gain: f32) {
    for sample in samples.chunks_exact_mut(2) {
        let scaled = i16::from_le_bytes([sample[0], sample[1]]) as f32 * gain;
        let clamped = scaled.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        sample.copy_from_slice(&clamped.to_le_bytes());
    }
}

/// Channels needed to hold every role of `layout` at its canonical slot.
pub fn output_channel_count(layout: &ChannelLayout) -> usize {
    layout
        .roles()
        .iter()
        .filter_map(|role| role.canonical_slot())
        .max()
        .map_or(0, |slot| slot + 1)
}

#[derive(Debug, Clone)]
struct InputFormat {
    roles: Vec<Option<ChannelRole>>,
    bytes_per_sample: usize,
    sample_rate: u32,
}

/// Moves each input channel to the output slot holding the same role.
///
/// Output slots with no matching input channel are zero-filled. Input
/// channels whose role has no output slot are dropped.
#[derive(Debug, Clone, Default)]
pub struct ChannelRemapper {
    input: Option<InputFormat>,
    slots: Option<Vec<ChannelRole>>,
    routes: Vec<Option<usize>>,
}

impl ChannelRemapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Describes the caller's interleaved channels and returns the canonical
    /// roles among them, in canonical slot order.
    ///
    /// Channels past the end of `channel_map`, and roles with no canonical
    /// slot, are left out of the returned layout.
    pub fn set_input_format(
        &mut self,
        channel_count: usize,
        channel_map: &[ChannelRole],
        bytes_per_sample: usize,
        sample_rate: u32,
    ) -> ChannelLayout {
        let roles: Vec<Option<ChannelRole>> =
            (0..channel_count).map(|i| channel_map.get(i).copied()).collect();

        let canonical: Vec<ChannelRole> = CANONICAL_ROLES
            .into_iter()
            .filter(|slot| roles.contains(&Some(*slot)))
            .collect();

        for (i, role) in roles.iter().enumerate() {
            match role {
                None => warn!("Input channel {i} has no role"),
                Some(role) if role.canonical_slot().is_none() => {
                    debug!("Input channel {i} ({role}) has no renderer slot")
                }
                _ => (),
            }
        }

        self.input = Some(InputFormat {
            roles,
            bytes_per_sample,
            sample_rate,
        });
        self.update_routes();

        // At most one canonical role per slot, so this cannot fail
        ChannelLayout::new(canonical).unwrap_or_default()
    }

    /// Fixes the output to the first `channel_count` roles of
    /// `canonical_map`.
    pub fn set_output_format(&mut self, channel_count: usize, canonical_map: &[ChannelRole]) {
        let count = channel_count.min(canonical_map.len()).min(MAX_CHANNELS);
        self.slots = Some(canonical_map[..count].to_vec());
        self.update_routes();
    }

    fn update_routes(&mut self) {
        let (Some(input), Some(slots)) = (&self.input, &self.slots) else {
            self.routes.clear();
            return;
        };

        self.routes = input
            .roles
            .iter()
            .map(|role| role.and_then(|role| slots.iter().position(|&slot| slot == role)))
            .collect();
    }

    /// True when both formats are set, every input role is known, and the
    /// sample width is between one and four bytes.
    pub fn can_remap(&self) -> bool {
        let (Some(input), Some(slots)) = (&self.input, &self.slots) else {
            return false;
        };

        !slots.is_empty()
            && !input.roles.is_empty()
            && (1..=4).contains(&input.bytes_per_sample)
            && input
                .roles
                .iter()
                .all(|role| role.is_some_and(|role| role.canonical_slot().is_some()))
    }

    /// True when remapping would copy every channel to the same position.
    pub fn is_identity(&self) -> bool {
        let Some(slots) = &self.slots else {
            return false;
        };
        self.routes.len() == slots.len()
            && self
                .routes
                .iter()
                .enumerate()
                .all(|(i, route)| *route == Some(i))
    }

    pub fn input_channels(&self) -> usize {
        self.input.as_ref().map_or(0, |input| input.roles.len())
    }

    pub fn output_channels(&self) -> usize {
        self.slots.as_ref().map_or(0, Vec::len)
    }

    pub fn sample_rate(&self) -> u32 {
        self.input.as_ref().map_or(0, |input| input.sample_rate)
    }

    pub fn input_frame_bytes(&self) -> usize {
        self.input
            .as_ref()
            .map_or(0, |input| input.roles.len() * input.bytes_per_sample)
    }

    pub fn output_frame_bytes(&self) -> usize {
        self.input
            .as_ref()
            .map_or(0, |input| self.output_channels() * input.bytes_per_sample)
    }

    /// Remaps up to `frames` frames from `input` into `output` and returns
    /// the number of frames written. The count is bounded by both slices.
    ///
    /// A non-zero `drc` level in millibels is applied to 16-bit samples.
    pub fn remap(&self, input: &[u8], output: &mut [u8], frames: usize, drc: i32) -> usize {
        let Some(format) = &self.input else {
            return 0;
        };

        let bps = format.bytes_per_sample;
        let in_frame = self.input_frame_bytes();
        let out_frame = self.output_frame_bytes();
        if in_frame == 0 || out_frame == 0 {
            return 0;
        }

        let frames = frames
            .min(input.len() / in_frame)
            .min(output.len() / out_frame);
        let out = &mut output[..frames * out_frame];
        out.fill(0);

        for (src, dst) in input
            .chunks_exact(in_frame)
            .zip(out.chunks_exact_mut(out_frame))
        {
            for (channel, route) in self.routes.iter().enumerate() {
                if let Some(slot) = route {
                    dst[slot * bps..(slot + 1) * bps]
                        .copy_from_slice(&src[channel * bps..(channel + 1) * bps]);
                }
            }
        }

        if drc != 0 && bps == 2 {
            scale_s16_le(out, gain_from_millibels(drc));
        }

        frames
    }
}
