//! Advertising data structures
//!
//! Advertising payloads are a sequence of length-type-value structures.
//! This module defines the few AD types the proxy uses and the connectable
//! advertising parameter sets.

use std::time::Duration;

/// AD type: flags.
pub const AD_FLAGS: u8 = 0x01;
/// AD type: complete list of 16-bit service UUIDs.
pub const AD_UUID16_ALL: u8 = 0x03;
/// AD type: complete local name.
pub const AD_NAME_COMPLETE: u8 = 0x09;
/// AD type: service data with a 16-bit UUID.
pub const AD_SVC_DATA16: u8 = 0x16;

/// LE General Discoverable Mode.
pub const FLAG_GENERAL_DISCOVERABLE: u8 = 0x02;
/// BR/EDR not supported.
pub const FLAG_NO_BREDR: u8 = 0x04;

/// One AD structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdStructure {
    pub ad_type: u8,
    pub data: Vec<u8>,
}

impl AdStructure {
    pub fn new(ad_type: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            ad_type,
            data: data.into(),
        }
    }

    /// Encoded length including the length and type octets.
    pub fn encoded_len(&self) -> usize {
        self.data.len() + 2
    }
}

/// Serialize AD structures into raw advertising data.
pub fn encode(structures: &[AdStructure]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(structures.iter().map(AdStructure::encoded_len).sum());
    for ad in structures {
        buf.push((ad.data.len() + 1) as u8);
        buf.push(ad.ad_type);
        buf.extend_from_slice(&ad.data);
    }
    buf
}

/// Parse raw advertising data back into AD structures.
///
/// Returns `None` if a structure runs past the end of the buffer. A zero
/// length octet terminates parsing early, as padding does on air.
pub fn decode(mut raw: &[u8]) -> Option<Vec<AdStructure>> {
    let mut out = Vec::new();
    while let Some((&len, rest)) = raw.split_first() {
        if len == 0 {
            break;
        }
        let len = len as usize;
        if rest.len() < len {
            return None;
        }
        out.push(AdStructure::new(rest[0], &rest[1..len]));
        raw = &rest[len..];
    }
    Some(out)
}

/// Connectable undirected advertising parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvParams {
    pub connectable: bool,
    pub interval_min: Duration,
    pub interval_max: Duration,
}

impl AdvParams {
    /// Fast interval, used while Node Identity is advertised.
    pub const fn fast() -> Self {
        Self {
            connectable: true,
            interval_min: Duration::from_millis(100),
            interval_max: Duration::from_millis(150),
        }
    }

    /// Slow interval, used for Network ID advertising.
    pub const fn slow() -> Self {
        Self {
            connectable: true,
            interval_min: Duration::from_millis(1000),
            interval_max: Duration::from_millis(1200),
        }
    }
}
