//! Logical channels and per-packet delivery parameters

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Largest payload accepted by `send`, before compression
pub const MAX_PACKET_SIZE: usize = 4096;

/// Default ceiling for compressed unreliable packets
pub const DEFAULT_MTU: usize = 1200;

/// Number of logical channels
pub const CHANNEL_COUNT: usize = 11;

/// Logical packet category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Channel {
    Service = 0,
    Private = 1,
    Default = 2,
    Replication = 3,
    ReplicationDiff = 4,
    Input = 5,
    Transport = 6,
    Token = 7,
    Time = 8,
    GameMode = 9,
    DeltaReplication = 10,
}

impl Channel {
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::Service,
        Channel::Private,
        Channel::Default,
        Channel::Replication,
        Channel::ReplicationDiff,
        Channel::Input,
        Channel::Transport,
        Channel::Token,
        Channel::Time,
        Channel::GameMode,
        Channel::DeltaReplication,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::Service => "service",
            Channel::Private => "private",
            Channel::Default => "default",
            Channel::Replication => "replication",
            Channel::ReplicationDiff => "replication_diff",
            Channel::Input => "input",
            Channel::Transport => "transport",
            Channel::Token => "token",
            Channel::Time => "time",
            Channel::GameMode => "game_mode",
            Channel::DeltaReplication => "delta_replication",
        }
    }

    /// Delivery used when the caller has no preference
    pub fn default_params(self) -> PacketParams {
        match self {
            Channel::Input | Channel::Time | Channel::ReplicationDiff | Channel::DeltaReplication => {
                PacketParams::unreliable(self)
            }
            _ => PacketParams::reliable(self),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Delivery flags handed to the engine
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SendFlags: u8 {
        const RELIABLE = 1 << 0;
        const SEQUENCED = 1 << 1;
        const UNSEQUENCED = 1 << 2;
        const RELIABLE_FRAGMENT = 1 << 3;
        const UNRELIABLE_FRAGMENT = 1 << 4;
        /// Engine must not copy the buffer
        const NO_COPY = 1 << 5;
    }
}

impl SendFlags {
    #[inline]
    pub fn is_reliable(self) -> bool {
        self.contains(SendFlags::RELIABLE)
    }

    /// Unreliable packets that still drop stale (out of order) arrivals
    #[inline]
    pub fn is_sequenced_unreliable(self) -> bool {
        !self.is_reliable() && !self.contains(SendFlags::UNSEQUENCED)
    }
}

/// How one packet should be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketParams {
    pub channel: Channel,
    pub is_reliable: bool,
    pub is_sequenced: bool,
    pub is_reliable_fragment: bool,
    pub is_copy: bool,
}

impl PacketParams {
    /// Reliable, ordered, fragmentable
    pub fn reliable(channel: Channel) -> Self {
        Self {
            channel,
            is_reliable: true,
            is_sequenced: true,
            is_reliable_fragment: true,
            is_copy: true,
        }
    }

    /// Unreliable and unsequenced, fragments allowed
    pub fn unreliable(channel: Channel) -> Self {
        Self {
            channel,
            is_reliable: false,
            is_sequenced: false,
            is_reliable_fragment: false,
            is_copy: true,
        }
    }

    /// Engine flags for these parameters
    pub fn flags(&self) -> SendFlags {
        let mut flags = SendFlags::empty();
        if self.is_reliable {
            debug_assert!(
                self.is_sequenced && self.is_reliable_fragment,
                "reliable packets must be sequenced and fragmentable"
            );
            flags |= SendFlags::RELIABLE | SendFlags::SEQUENCED | SendFlags::RELIABLE_FRAGMENT;
        } else {
            flags |= if self.is_sequenced {
                SendFlags::SEQUENCED
            } else {
                SendFlags::UNSEQUENCED
            };
            if !self.is_reliable_fragment {
                flags |= SendFlags::UNRELIABLE_FRAGMENT;
            }
        }
        if !self.is_copy {
            flags |= SendFlags::NO_COPY;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_ids_are_dense() {
        for (i, ch) in Channel::ALL.iter().enumerate() {
            assert_eq!(ch.index(), i);
            assert_eq!(Channel::from_id(i as u8), Some(*ch));
        }
        assert_eq!(Channel::from_id(CHANNEL_COUNT as u8), None);
        assert_eq!(Channel::Token.id(), 7);
    }

    #[test]
    fn test_reliable_flags() {
        let flags = PacketParams::reliable(Channel::Token).flags();
        assert!(flags.is_reliable());
        assert!(flags.contains(SendFlags::SEQUENCED | SendFlags::RELIABLE_FRAGMENT));
        assert!(!flags.contains(SendFlags::UNSEQUENCED));
        assert!(!flags.contains(SendFlags::NO_COPY));
    }

    #[test]
    fn test_unreliable_flags() {
        let flags = PacketParams::unreliable(Channel::Input).flags();
        assert!(!flags.is_reliable());
        assert!(flags.contains(SendFlags::UNSEQUENCED | SendFlags::UNRELIABLE_FRAGMENT));
        assert!(!flags.is_sequenced_unreliable());

        let sequenced = PacketParams {
            is_sequenced: true,
            is_copy: false,
            ..PacketParams::unreliable(Channel::Time)
        };
        let flags = sequenced.flags();
        assert!(flags.contains(SendFlags::SEQUENCED | SendFlags::NO_COPY));
        assert!(flags.is_sequenced_unreliable());
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_reliable_must_be_sequenced() {
        let params = PacketParams {
            is_sequenced: false,
            ..PacketParams::reliable(Channel::Default)
        };
        let _ = params.flags();
    }
}
