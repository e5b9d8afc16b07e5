// src/tos.rs
//! DSCP/TOS classification for per-class RTT penalties.
//!
//! A TOS byte selects one of a handful of traffic classes; each class
//! adjusts the interface's RTT penalty profile before the neighbour cost
//! is computed. Codepoints not listed here (DF, LE, unknown) keep the
//! interface defaults.

use serde::{Deserialize, Serialize};

// TOS-byte encodings of the DSCP codepoints (DSCP << 2).
pub const DSCP_DF: u8 = 0x00;
pub const DSCP_LE: u8 = 0x04;
pub const DSCP_CS1: u8 = 0x20;
pub const DSCP_AF11: u8 = 0x28;
pub const DSCP_AF12: u8 = 0x30;
pub const DSCP_AF13: u8 = 0x38;
pub const DSCP_CS2: u8 = 0x40;
pub const DSCP_AF21: u8 = 0x48;
pub const DSCP_AF22: u8 = 0x50;
pub const DSCP_AF23: u8 = 0x58;
pub const DSCP_CS3: u8 = 0x60;
pub const DSCP_AF31: u8 = 0x68;
pub const DSCP_AF32: u8 = 0x70;
pub const DSCP_AF33: u8 = 0x78;
pub const DSCP_CS4: u8 = 0x80;
pub const DSCP_AF41: u8 = 0x88;
pub const DSCP_AF42: u8 = 0x90;
pub const DSCP_AF43: u8 = 0x98;
pub const DSCP_CS5: u8 = 0xA0;
pub const DSCP_EF: u8 = 0xB8;
pub const DSCP_CS6: u8 = 0xC0;

/// A single-byte TOS qualifier on routes and sources.
///
/// [`Tos::DEFAULT`] is the unclassified sentinel and coincides with
/// DSCP DF, so unqualified routes always get the default profile.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Tos(pub u8);

impl Tos {
    pub const DEFAULT: Tos = Tos(DSCP_DF);

    pub fn is_default(self) -> bool {
        self.0 == DSCP_DF
    }

    pub fn class(self) -> TrafficClass {
        TrafficClass::classify(self.0)
    }
}

impl std::fmt::Display for Tos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// RTT penalty parameters, per interface and adjusted per class.
///
/// `rtt_min`/`rtt_max` are in microseconds, `max_rtt_penalty` in metric
/// units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RttProfile {
    pub rtt_min: u32,
    pub rtt_max: u32,
    pub max_rtt_penalty: u32,
}

/// Traffic classes with distinct RTT sensitivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficClass {
    /// CS1, AF11-13: bulk transfers, RTT-insensitive.
    HighThroughput,
    /// CS2, AF21-23: OAM and latency-sensitive data.
    LowLatency,
    /// CS3, AF31-33: video streaming.
    Video,
    /// CS4, AF41-43: real-time interactive.
    RealTime,
    /// CS5, EF, CS6: telephony, signaling, routing control.
    AudioControl,
    /// DF, LE and anything unrecognised.
    Default,
}

impl TrafficClass {
    pub fn classify(tos: u8) -> TrafficClass {
        match tos {
            DSCP_CS1 | DSCP_AF11 | DSCP_AF12 | DSCP_AF13 => TrafficClass::HighThroughput,
            DSCP_CS2 | DSCP_AF21 | DSCP_AF22 | DSCP_AF23 => TrafficClass::LowLatency,
            DSCP_CS3 | DSCP_AF31 | DSCP_AF32 | DSCP_AF33 => TrafficClass::Video,
            DSCP_CS4 | DSCP_AF41 | DSCP_AF42 | DSCP_AF43 => TrafficClass::RealTime,
            DSCP_CS5 | DSCP_EF | DSCP_CS6 => TrafficClass::AudioControl,
            _ => TrafficClass::Default,
        }
    }

    /// Adjust an interface RTT profile for this class.
    ///
    /// Returns `None` for [`TrafficClass::HighThroughput`], which takes no
    /// RTT penalty at all. The divisions deliberately floor; a configured
    /// `rtt_min` below 4 µs collapses to 0 for the aggressive classes,
    /// meaning "always penalise".
    pub fn adjust(self, profile: RttProfile) -> Option<RttProfile> {
        let RttProfile {
            mut rtt_min,
            mut rtt_max,
            mut max_rtt_penalty,
        } = profile;

        match self {
            TrafficClass::HighThroughput => return None,
            TrafficClass::LowLatency => {
                max_rtt_penalty *= 2;
                rtt_min /= 4;
                rtt_max /= 2;
            }
            TrafficClass::Video => {
                rtt_min /= 2;
            }
            TrafficClass::RealTime => {
                rtt_min /= 4;
                rtt_max /= 2;
            }
            TrafficClass::AudioControl => {
                max_rtt_penalty *= 2;
                rtt_min /= 2;
            }
            TrafficClass::Default => {}
        }

        Some(RttProfile {
            rtt_min,
            rtt_max,
            max_rtt_penalty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: RttProfile = RttProfile {
        rtt_min: 10_000,
        rtt_max: 110_000,
        max_rtt_penalty: 96,
    };

    #[test]
    fn classify_covers_table() {
        assert_eq!(TrafficClass::classify(DSCP_AF12), TrafficClass::HighThroughput);
        assert_eq!(TrafficClass::classify(DSCP_AF21), TrafficClass::LowLatency);
        assert_eq!(TrafficClass::classify(DSCP_CS3), TrafficClass::Video);
        assert_eq!(TrafficClass::classify(DSCP_AF43), TrafficClass::RealTime);
        assert_eq!(TrafficClass::classify(DSCP_EF), TrafficClass::AudioControl);
        assert_eq!(TrafficClass::classify(DSCP_DF), TrafficClass::Default);
        assert_eq!(TrafficClass::classify(DSCP_LE), TrafficClass::Default);
        assert_eq!(TrafficClass::classify(0xFF), TrafficClass::Default);
    }

    #[test]
    fn high_throughput_has_no_penalty() {
        assert_eq!(TrafficClass::HighThroughput.adjust(BASE), None);
    }

    #[test]
    fn low_latency_doubles_penalty_and_shrinks_window() {
        let p = TrafficClass::LowLatency.adjust(BASE).unwrap();
        assert_eq!(p.max_rtt_penalty, 192);
        assert_eq!(p.rtt_min, 2_500);
        assert_eq!(p.rtt_max, 55_000);
    }

    #[test]
    fn default_class_keeps_profile() {
        assert_eq!(TrafficClass::Default.adjust(BASE), Some(BASE));
    }

    #[test]
    fn tiny_rtt_min_floors_to_zero() {
        let p = TrafficClass::RealTime
            .adjust(RttProfile {
                rtt_min: 3,
                rtt_max: 100,
                max_rtt_penalty: 10,
            })
            .unwrap();
        assert_eq!(p.rtt_min, 0);
    }

    #[test]
    fn default_tos_sentinel_is_df() {
        assert!(Tos::DEFAULT.is_default());
        assert_eq!(Tos::DEFAULT.class(), TrafficClass::Default);
    }
}
