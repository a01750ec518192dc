// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/reply correlation token and its metadata encodings.
//!
//! A [`SampleIdentity`] (origin GUID + sequence number) travels out of band
//! in the message metadata, under one of two parameter ids:
//!
//! | Slot     | Parameter id | Written by                         |
//! |----------|--------------|------------------------------------|
//! | legacy   | `0x800f`     | Fast-DDS based rmw implementations |
//! | standard | `0x0083`     | DDS-RPC `related_sample_identity`  |
//!
//! Both slots carry the same 24-byte layout:
//!
//! ```text
//! 0               16        20        24
//! +---------------+---------+---------+
//! | origin GUID   | hi (LE) | lo (LE) |
//! +---------------+---------+---------+
//! sequence = (hi << 31) | lo
//! ```
//!
//! The 31-bit split mirrors the legacy representation, so only sequence
//! numbers below 2^62 survive a round trip.

use crate::error::{ServiceError, ServiceResult};
use crate::guid::Guid;
use crate::transport::Parameters;
use serde::{Deserialize, Serialize};

/// Fast-DDS legacy sample identity parameter.
pub const PID_FASTDDS_SAMPLE_IDENTITY: u16 = 0x800f;
/// DDS-RPC related sample identity parameter.
pub const PID_RELATED_SAMPLE_IDENTITY: u16 = 0x0083;

const LOW_BITS: u32 = 31;
const LOW_MASK: u64 = (1 << LOW_BITS) - 1;

/// Unique identifier for a request, used for request/reply correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleIdentity {
    /// GUID of the endpoint that issued the request
    pub origin: Guid,
    /// Sequence number assigned by the issuing endpoint (starts at 1)
    pub sequence: u64,
}

impl SampleIdentity {
    /// Encoded size: 16 (GUID) + 4 (hi) + 4 (lo)
    pub const ENCODED_LEN: usize = 24;

    /// Largest sequence number that survives [`encode`](Self::encode).
    pub const MAX_SEQUENCE: u64 = (1 << (2 * LOW_BITS)) - 1;

    pub fn new(origin: Guid, sequence: u64) -> Self {
        Self { origin, sequence }
    }

    /// Encode into the 24-byte metadata representation.
    ///
    /// Lossy above [`MAX_SEQUENCE`](Self::MAX_SEQUENCE): both halves keep
    /// 31 bits, so the encoded sequence wraps modulo 2^62.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let hi = ((self.sequence >> LOW_BITS) & LOW_MASK) as u32;
        let lo = (self.sequence & LOW_MASK) as u32;

        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..16].copy_from_slice(&self.origin.as_bytes());
        buf[16..20].copy_from_slice(&hi.to_le_bytes());
        buf[20..24].copy_from_slice(&lo.to_le_bytes());
        buf
    }

    /// Decode from the 24-byte metadata representation.
    pub fn decode(src: &[u8]) -> ServiceResult<Self> {
        if src.len() != Self::ENCODED_LEN {
            return Err(ServiceError::MalformedIdentity { len: src.len() });
        }

        let mut origin = [0u8; 16];
        origin.copy_from_slice(&src[0..16]);
        let hi = u32::from_le_bytes([src[16], src[17], src[18], src[19]]);
        let lo = u32::from_le_bytes([src[20], src[21], src[22], src[23]]);

        Ok(Self {
            origin: Guid::from_bytes(origin),
            sequence: (u64::from(hi) << LOW_BITS) | u64::from(lo),
        })
    }
}

/// Which metadata slot(s) a client writes its request identity into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentitySlots {
    /// Fast-DDS legacy slot only.
    #[default]
    Legacy,
    /// DDS-RPC related sample identity slot only.
    Standard,
    /// Both slots, each carrying the same bytes.
    Both,
}

impl IdentitySlots {
    /// Parameter ids covered by this convention.
    pub fn parameter_ids(self) -> &'static [u16] {
        match self {
            Self::Legacy => &[PID_FASTDDS_SAMPLE_IDENTITY],
            Self::Standard => &[PID_RELATED_SAMPLE_IDENTITY],
            Self::Both => &[PID_FASTDDS_SAMPLE_IDENTITY, PID_RELATED_SAMPLE_IDENTITY],
        }
    }

    /// Build request metadata carrying `identity` in the selected slot(s).
    pub fn tag(self, identity: &SampleIdentity) -> Parameters {
        let encoded = identity.encode().to_vec();
        let mut params = Parameters::new();
        for &pid in self.parameter_ids() {
            params.insert(pid, encoded.clone());
        }
        params
    }
}

impl std::str::FromStr for IdentitySlots {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" | "fastdds" => Ok(Self::Legacy),
            "standard" | "related" => Ok(Self::Standard),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown identity slot convention '{}'", other)),
        }
    }
}

/// Identity found in a message, with the slots it was found under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityMatch {
    /// Decoded token.
    pub identity: SampleIdentity,
    /// Raw bytes of the preferred slot, echoed back verbatim on replies.
    pub raw: Vec<u8>,
    /// Parameter ids that carried the identity.
    pub slots: Vec<u16>,
}

impl IdentityMatch {
    /// Build reply metadata: every slot of the request, each set to the
    /// request's identity bytes.
    pub fn reply_parameters(&self) -> Parameters {
        self.slots
            .iter()
            .map(|&pid| (pid, self.raw.clone()))
            .collect()
    }
}

/// Look up the identity in message metadata.
///
/// The standard slot is preferred, the legacy slot accepted. When both are
/// present they must decode to the same token, otherwise the message is
/// rejected with [`ServiceError::IdentityMismatch`]. Returns `Ok(None)` when
/// neither slot is present.
pub fn find_identity(params: &Parameters) -> ServiceResult<Option<IdentityMatch>> {
    let legacy = params.get(&PID_FASTDDS_SAMPLE_IDENTITY);
    let standard = params.get(&PID_RELATED_SAMPLE_IDENTITY);

    match (legacy, standard) {
        (None, None) => Ok(None),
        (Some(raw), None) => Ok(Some(IdentityMatch {
            identity: SampleIdentity::decode(raw)?,
            raw: raw.clone(),
            slots: vec![PID_FASTDDS_SAMPLE_IDENTITY],
        })),
        (None, Some(raw)) => Ok(Some(IdentityMatch {
            identity: SampleIdentity::decode(raw)?,
            raw: raw.clone(),
            slots: vec![PID_RELATED_SAMPLE_IDENTITY],
        })),
        (Some(legacy_raw), Some(standard_raw)) => {
            let legacy = SampleIdentity::decode(legacy_raw)?;
            let standard = SampleIdentity::decode(standard_raw)?;
            if legacy != standard {
                return Err(ServiceError::IdentityMismatch { legacy, standard });
            }
            Ok(Some(IdentityMatch {
                identity: standard,
                raw: standard_raw.clone(),
                slots: vec![PID_FASTDDS_SAMPLE_IDENTITY, PID_RELATED_SAMPLE_IDENTITY],
            }))
        }
    }
}
