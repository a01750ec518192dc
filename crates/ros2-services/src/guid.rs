// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint identifiers (GUID = 12-byte participant prefix + 4-byte entity id).

use std::fmt;

/// Participant-level part of a GUID, assigned by the transport.
pub type GuidPrefix = [u8; 12];

/// Endpoint-level part of a GUID, assigned per publication/subscription.
pub type EntityId = [u8; 4];

/// Globally unique endpoint identifier.
///
/// Used as the `origin` of a [`SampleIdentity`](crate::identity::SampleIdentity):
/// the prefix of the local participant followed by the entity id of the
/// request publication.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid {
    pub prefix: GuidPrefix,
    pub entity_id: EntityId,
}

impl Guid {
    /// Size of a GUID on the wire.
    pub const LEN: usize = 16;

    /// Create GUID from separate prefix and entity ID
    pub fn new(prefix: GuidPrefix, entity_id: EntityId) -> Self {
        Self { prefix, entity_id }
    }

    /// Create GUID from raw bytes (16 bytes total)
    ///
    /// # Examples
    /// ```
    /// use ros2_services::Guid;
    ///
    /// let bytes = [1, 15, 172, 16, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 1, 3];
    /// let guid = Guid::from_bytes(bytes);
    /// assert_eq!(guid.entity_id, [0, 0, 1, 3]);
    /// ```
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut prefix = [0u8; 12];
        let mut entity_id = [0u8; 4];
        prefix.copy_from_slice(&bytes[0..12]);
        entity_id.copy_from_slice(&bytes[12..16]);
        Self { prefix, entity_id }
    }

    /// Convert GUID to 16-byte array
    pub fn as_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..12].copy_from_slice(&self.prefix);
        bytes[12..16].copy_from_slice(&self.entity_id);
        bytes
    }

    /// Create GUID with all zeros (invalid/placeholder)
    pub fn zero() -> Self {
        Self {
            prefix: [0; 12],
            entity_id: [0; 4],
        }
    }

    /// Check if GUID is zero (invalid)
    pub fn is_zero(&self) -> bool {
        self.prefix.iter().all(|&b| b == 0) && self.entity_id.iter().all(|&b| b == 0)
    }
}

/// Generate a participant prefix unique to this process and moment.
///
/// Bytes 0-7 carry a nanosecond timestamp, 8-11 a hash of the process id
/// and current thread, so two buses created in one process still differ.
pub fn generate_prefix() -> GuidPrefix {
    use std::hash::{Hash, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let mut prefix = [0u8; 12];
    prefix[0..8].copy_from_slice(&(now.as_nanos() as u64).to_le_bytes());

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::process::id().hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    now.subsec_nanos().hash(&mut hasher);
    prefix[8..12].copy_from_slice(&(hasher.finish() as u32).to_le_bytes());

    prefix
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Format: "01.0f.ac.10.00.00.00.00.00.00.00.01.00.00.01.03"
        for (i, byte) in self.prefix.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        for byte in &self.entity_id {
            write!(f, ".{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self)
    }
}
