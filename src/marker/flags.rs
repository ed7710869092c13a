//! Marker state flags
//!
//! Boolean switches on a marker instance packed into one bitset.

use bitflags::bitflags;

bitflags! {
    /// Per-marker switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MarkerFlags: u8 {
        /// Broadcast on the reliable channel
        const RELIABLE = 1 << 0;
        /// Soft toggle: hidden markers stay indexed but have no subscribers
        const VISIBLE = 1 << 1;
        /// Hard kill switch: cleared markers are swept on the next scan
        const ALIVE = 1 << 2;
        /// Rotate the offset by the full base orientation instead of yaw only
        const FULL_ORIENTATION = 1 << 3;
    }
}

impl Default for MarkerFlags {
    fn default() -> Self {
        Self::VISIBLE | Self::ALIVE
    }
}

impl MarkerFlags {
    pub fn is_visible(&self) -> bool {
        self.contains(Self::VISIBLE)
    }

    pub fn is_alive(&self) -> bool {
        self.contains(Self::ALIVE)
    }

    pub fn is_reliable(&self) -> bool {
        self.contains(Self::RELIABLE)
    }

    pub fn full_orientation(&self) -> bool {
        self.contains(Self::FULL_ORIENTATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags() {
        let flags = MarkerFlags::default();
        assert!(flags.is_visible());
        assert!(flags.is_alive());
        assert!(!flags.is_reliable());
        assert!(!flags.full_orientation());
    }

    #[test]
    fn test_flag_toggles() {
        let mut flags = MarkerFlags::default();
        flags.remove(MarkerFlags::ALIVE);
        flags.set(MarkerFlags::RELIABLE, true);

        assert!(!flags.is_alive());
        assert!(flags.is_reliable());
        assert!(flags.is_visible());
    }
}
