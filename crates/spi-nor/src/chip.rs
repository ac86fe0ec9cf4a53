//! Per-chip safe operating envelopes.
//!
//! Bench clocks and timeouts are clamped to what the detected part (and
//! typical breadboard wiring) tolerates. Unknown parts get conservative
//! limits.

use crate::command::JedecId;

/// Clock and timeout limits for one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SafeEnvelope {
    /// Human-readable part name.
    pub name: &'static str,
    /// Highest clock used for reads.
    pub max_read_hz: u32,
    /// Highest clock used for erase/program and their verify.
    pub max_write_hz: u32,
    /// Minimum timeout for a 4 KB sector erase.
    pub erase_timeout_ms: u32,
}

/// Limits for parts not in [`KNOWN_PARTS`].
pub const CONSERVATIVE: SafeEnvelope = SafeEnvelope {
    name: "unknown",
    max_read_hz: 12_000_000,
    max_write_hz: 8_000_000,
    erase_timeout_ms: 4000,
};

/// Parts with measured limits, keyed by packed JEDEC id.
pub const KNOWN_PARTS: &[(u32, SafeEnvelope)] = &[
    (
        0xEF_4016,
        SafeEnvelope {
            name: "Winbond W25Q32FV",
            // rated 104 MHz; 50 MHz is the highest bench clock worth trying
            max_read_hz: 50_000_000,
            max_write_hz: 12_000_000,
            erase_timeout_ms: 2000,
        },
    ),
    (
        0xBF_2641,
        SafeEnvelope {
            name: "SST/Microchip 26F016B",
            max_read_hz: 20_000_000,
            max_write_hz: 8_000_000,
            erase_timeout_ms: 4000,
        },
    ),
];

impl SafeEnvelope {
    /// Envelope for `id`, or [`CONSERVATIVE`].
    pub fn for_jedec(id: JedecId) -> Self {
        let key = id.to_u32();
        KNOWN_PARTS
            .iter()
            .find(|(k, _)| *k == key)
            .map_or(CONSERVATIVE, |(_, env)| *env)
    }

    /// `true` when this is the fallback envelope.
    pub fn is_conservative(&self) -> bool {
        *self == CONSERVATIVE
    }

    /// Reads at `hz` are within limits.
    pub const fn allows_read(&self, hz: u32) -> bool {
        hz <= self.max_read_hz
    }

    /// Program clock after clamping a requested one.
    pub fn clamp_write(&self, hz: u32) -> u32 {
        hz.min(self.max_write_hz)
    }

    /// Erase timeout: the longer of the requested and the part's minimum.
    pub fn erase_timeout(&self, requested_ms: u32) -> u32 {
        requested_ms.max(self.erase_timeout_ms)
    }
}

impl Default for SafeEnvelope {
    fn default() -> Self {
        CONSERVATIVE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn known_parts() {
        let w = SafeEnvelope::for_jedec(JedecId::from_u32(0xEF4016));
        assert_eq!(w.max_read_hz, 50_000_000);
        assert_eq!(w.max_write_hz, 12_000_000);
        assert_eq!(w.erase_timeout_ms, 2000);

        let s = SafeEnvelope::for_jedec(JedecId::from_u32(0xBF2641));
        assert_eq!(s.max_read_hz, 20_000_000);
        assert!(!s.is_conservative());
    }

    #[test]
    fn unknown_part_is_conservative() {
        let e = SafeEnvelope::for_jedec(JedecId::from_u32(0xC22016));
        assert!(e.is_conservative());
        assert!(e.allows_read(12_000_000));
        assert!(!e.allows_read(24_000_000));
    }

    #[test]
    fn clamping() {
        let e = SafeEnvelope::for_jedec(JedecId::from_u32(0xEF4016));
        assert_eq!(e.clamp_write(24_000_000), 12_000_000);
        assert_eq!(e.clamp_write(8_000_000), 8_000_000);
        assert_eq!(e.erase_timeout(800), 2000);
        assert_eq!(e.erase_timeout(5000), 5000);
    }
}
