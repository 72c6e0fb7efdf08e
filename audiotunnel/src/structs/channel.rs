//! Speaker roles and channel layouts.
//!
//! The renderer consumes interleaved channels in a fixed canonical slot
//! order: FL, FR, BL, BR, FC, LFE, SL, SR. Every other role is known by name
//! but has no slot, so it cannot be routed to the renderer.

use std::fmt::{self, Display};
use std::str::FromStr;

use crate::utils::errors::LayoutError;

pub const MAX_CHANNELS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    FrontLeft,
    FrontRight,
    FrontCenter,
    LowFrequency,
    BackLeft,
    BackRight,
    FrontLeftOfCenter,
    FrontRightOfCenter,
    BackCenter,
    SideLeft,
    SideRight,
    TopCenter,
}

/// Canonical renderer slot order.
pub const CANONICAL_ROLES: [ChannelRole; MAX_CHANNELS] = [
    ChannelRole::FrontLeft,
    ChannelRole::FrontRight,
    ChannelRole::BackLeft,
    ChannelRole::BackRight,
    ChannelRole::FrontCenter,
    ChannelRole::LowFrequency,
    ChannelRole::SideLeft,
    ChannelRole::SideRight,
];

impl ChannelRole {
    const ALL: [ChannelRole; 12] = [
        Self::FrontLeft,
        Self::FrontRight,
        Self::FrontCenter,
        Self::LowFrequency,
        Self::BackLeft,
        Self::BackRight,
        Self::FrontLeftOfCenter,
        Self::FrontRightOfCenter,
        Self::BackCenter,
        Self::SideLeft,
        Self::SideRight,
        Self::TopCenter,
    ];

    /// Position of this role in the canonical slot order, if it has one.
    pub fn canonical_slot(self) -> Option<usize> {
        CANONICAL_ROLES.iter().position(|&role| role == self)
    }

    /// `SPEAKER_*` bit used in WAVE channel masks.
    pub fn speaker_mask(self) -> u32 {
        match self {
            Self::FrontLeft => 0x1,
            Self::FrontRight => 0x2,
            Self::FrontCenter => 0x4,
            Self::LowFrequency => 0x8,
            Self::BackLeft => 0x10,
            Self::BackRight => 0x20,
            Self::FrontLeftOfCenter => 0x40,
            Self::FrontRightOfCenter => 0x80,
            Self::BackCenter => 0x100,
            Self::SideLeft => 0x200,
            Self::SideRight => 0x400,
            Self::TopCenter => 0x800,
        }
    }

    pub fn abbreviation(self) -> &'static str {
        match self {
            Self::FrontLeft => "FL",
            Self::FrontRight => "FR",
            Self::FrontCenter => "FC",
            Self::LowFrequency => "LFE",
            Self::BackLeft => "BL",
            Self::BackRight => "BR",
            Self::FrontLeftOfCenter => "FLC",
            Self::FrontRightOfCenter => "FRC",
            Self::BackCenter => "BC",
            Self::SideLeft => "SL",
            Self::SideRight => "SR",
            Self::TopCenter => "TC",
        }
    }
}

impl Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbreviation())
    }
}

impl FromStr for ChannelRole {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|role| role.abbreviation().eq_ignore_ascii_case(s))
            .ok_or_else(|| LayoutError::UnknownRole(s.to_string()))
    }
}

/// Ordered list of distinct speaker roles, one per interleaved channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelLayout {
    roles: Vec<ChannelRole>,
}

impl ChannelLayout {
    pub fn new(roles: Vec<ChannelRole>) -> Result<Self, LayoutError> {
        if roles.len() > MAX_CHANNELS {
            return Err(LayoutError::TooManyChannels(roles.len()));
        }
        for (i, role) in roles.iter().enumerate() {
            if roles[..i].contains(role) {
                return Err(LayoutError::DuplicateRole(*role));
            }
        }
        Ok(Self { roles })
    }

    /// The first `channels` canonical slots.
    pub fn canonical(channels: usize) -> Self {
        Self {
            roles: CANONICAL_ROLES[..channels.min(MAX_CHANNELS)].to_vec(),
        }
    }

    /// Builds a layout from a WAVE channel mask.
    ///
    /// Roles with a canonical slot are taken in canonical order. When the mask
    /// does not describe exactly `channels` of them the canonical prefix is
    /// used instead.
    pub fn from_speaker_mask(mask: u32, channels: usize) -> Self {
        let roles: Vec<ChannelRole> = CANONICAL_ROLES
            .into_iter()
            .filter(|role| mask & role.speaker_mask() != 0)
            .collect();

        if roles.len() == channels {
            Self { roles }
        } else {
            Self::canonical(channels)
        }
    }

    pub fn roles(&self) -> &[ChannelRole] {
        &self.roles
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn speaker_mask(&self) -> u32 {
        self.roles.iter().fold(0, |mask, role| mask | role.speaker_mask())
    }

    /// True when every role has a canonical slot.
    pub fn is_routable(&self) -> bool {
        self.roles.iter().all(|role| role.canonical_slot().is_some())
    }

    /// True when the layout already matches the canonical slot order.
    pub fn is_canonical(&self) -> bool {
        self.roles[..] == CANONICAL_ROLES[..self.roles.len().min(MAX_CHANNELS)]
    }
}

impl Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.roles.iter().map(|r| r.abbreviation()).collect();
        write!(f, "{}", names.join(","))
    }
}

impl FromStr for ChannelLayout {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let roles = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(ChannelRole::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(roles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_slots() {
        assert_eq!(ChannelRole::FrontCenter.canonical_slot(), Some(4));
        assert_eq!(ChannelRole::SideRight.canonical_slot(), Some(7));
        assert_eq!(ChannelRole::TopCenter.canonical_slot(), None);
    }

    #[test]
    fn parse_layout() {
        let layout: ChannelLayout = "fl, fr ,FC,lfe".parse().unwrap();
        assert_eq!(layout.len(), 4);
        assert_eq!(layout.to_string(), "FL,FR,FC,LFE");
        assert_eq!(layout.speaker_mask(), 0xF);
        assert!(layout.is_routable());
        assert!(!layout.is_canonical());

        assert_eq!(
            "fl,fl".parse::<ChannelLayout>(),
            Err(LayoutError::DuplicateRole(ChannelRole::FrontLeft))
        );
        assert_eq!(
            "fl,xx".parse::<ChannelLayout>(),
            Err(LayoutError::UnknownRole("xx".to_string()))
        );
    }

    #[test]
    fn layout_from_mask() {
        let layout = ChannelLayout::from_speaker_mask(0x3F, 6);
        assert_eq!(layout, ChannelLayout::canonical(6));
        assert!(layout.is_canonical());

        // Top centre has no slot, so the mask cannot describe 3 channels
        assert_eq!(
            ChannelLayout::from_speaker_mask(0x803, 3),
            ChannelLayout::canonical(3)
        );
    }
}
