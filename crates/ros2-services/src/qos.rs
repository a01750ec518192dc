// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! QoS profile handed to the transport when binding service channels.

use serde::{Deserialize, Serialize};

/// Reliability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    BestEffort,
    #[default]
    Reliable,
}

/// Durability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    #[default]
    Volatile,
    TransientLocal,
}

/// History policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum History {
    KeepLast(u32),
    #[default]
    KeepAll,
}

/// QoS of one service channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QosProfile {
    pub reliability: Reliability,
    pub durability: Durability,
    pub history: History,
}

impl QosProfile {
    /// QoS profile for request/reply channels
    ///
    /// - Reliable: requests and replies are not lost
    /// - KeepAll: pending samples are kept until correlated
    /// - Volatile: no persistence needed for transient calls
    pub fn rpc() -> Self {
        Self {
            reliability: Reliability::Reliable,
            durability: Durability::Volatile,
            history: History::KeepAll,
        }
    }

    pub fn best_effort(mut self) -> Self {
        self.reliability = Reliability::BestEffort;
        self
    }

    pub fn keep_last(mut self, depth: u32) -> Self {
        self.history = History::KeepLast(depth);
        self
    }

    pub fn transient_local(mut self) -> Self {
        self.durability = Durability::TransientLocal;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_profile() {
        let qos = QosProfile::rpc();
        assert_eq!(qos.reliability, Reliability::Reliable);
        assert_eq!(qos.history, History::KeepAll);
        assert_eq!(qos.durability, Durability::Volatile);
        assert_eq!(qos, QosProfile::default());
    }

    #[test]
    fn builder_overrides() {
        let qos = QosProfile::rpc().best_effort().keep_last(10);
        assert_eq!(qos.reliability, Reliability::BestEffort);
        assert_eq!(qos.history, History::KeepLast(10));
    }
}
