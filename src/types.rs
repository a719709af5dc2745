/// Shared data model: chain primitives and persisted records
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// PRIMITIVES
// =============================================================================

/// Error returned when parsing a hex-encoded primitive
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {reason}")]
pub struct ParseHexError {
    pub kind: &'static str,
    pub reason: String,
}

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr, $kind:expr) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, SerializeDisplay, DeserializeFromStr,
        )]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = ParseHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let digits = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(digits).map_err(|e| ParseHexError {
                    kind: $kind,
                    reason: e.to_string(),
                })?;
                let bytes: [u8; $len] = bytes.try_into().map_err(|v: Vec<u8>| ParseHexError {
                    kind: $kind,
                    reason: format!("expected {} bytes, got {}", $len, v.len()),
                })?;
                Ok(Self(bytes))
            }
        }
    };
}

fixed_bytes!(
    /// 20-byte account address
    Address,
    20,
    "address"
);

fixed_bytes!(
    /// 32-byte hash (transaction or block)
    H256,
    32,
    "hash"
);

/// Amount in wei (gas prices and transfer values)
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug, SerializeDisplay, DeserializeFromStr,
)]
pub struct Wei(pub u128);

impl Wei {
    pub const ZERO: Wei = Wei(0);
    const WEI_PER_GWEI: u128 = 1_000_000_000;

    pub const fn from_gwei(gwei: u64) -> Self {
        Wei(gwei as u128 * Self::WEI_PER_GWEI)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// Human-readable gwei amount for log output
    pub fn to_gwei_string(&self) -> String {
        let whole = self.0 / Self::WEI_PER_GWEI;
        let frac = self.0 % Self::WEI_PER_GWEI;
        if frac == 0 {
            format!("{} gwei", whole)
        } else {
            let frac = format!("{:09}", frac);
            format!("{}.{} gwei", whole, frac.trim_end_matches('0'))
        }
    }
}

impl fmt::Display for Wei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Wei {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u128>().map(Wei)
    }
}

/// Hex (de)serialization for raw byte fields
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// CHAIN HEADS
// =============================================================================

/// Canonical chain block header subset
///
/// In memory a head may own its ancestry through `parent`, newest first. Only
/// the header fields are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    /// Unix timestamp in seconds
    pub timestamp: i64,
    #[serde(skip)]
    pub parent: Option<Box<Head>>,
}

impl Head {
    pub fn new(number: u64, hash: H256, parent_hash: H256, timestamp: i64) -> Self {
        Self {
            number,
            hash,
            parent_hash,
            timestamp,
            parent: None,
        }
    }

    /// Copy of the header fields without ancestry
    pub fn detached(&self) -> Head {
        Head::new(self.number, self.hash, self.parent_hash, self.timestamp)
    }

    /// Iterate this head and its ancestors, newest first
    pub fn ancestry(&self) -> impl Iterator<Item = &Head> {
        std::iter::successors(Some(self), |head| head.parent.as_deref())
    }

    /// Number of heads in the linked chain, including this one
    pub fn chain_length(&self) -> usize {
        self.ancestry().count()
    }

    pub fn earliest_in_chain(&self) -> &Head {
        self.ancestry().last().unwrap_or(self)
    }

    /// Hash of the chain member at `number`, if it is part of this chain
    pub fn hash_at_height(&self, number: u64) -> Option<H256> {
        self.ancestry().find(|head| head.number == number).map(|head| head.hash)
    }

    /// Build a linked chain from headers ordered newest first
    pub fn link(mut headers: Vec<Head>) -> Option<Head> {
        let mut linked: Option<Head> = None;
        while let Some(mut head) = headers.pop() {
            head.parent = linked.map(Box::new);
            linked = Some(head);
        }
        linked
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

// =============================================================================
// PERSISTED RECORDS
// =============================================================================

/// An address whose transactions are managed here
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    /// Next nonce to assign; `None` until learned from the chain
    pub next_nonce: Option<u64>,
    /// Owned transactions in creation order
    pub tx_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            next_nonce: None,
            tx_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Unstarted,
    InProgress,
    Unconfirmed,
    Confirmed,
    ConfirmedMissingReceipt,
    FatalError,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Unstarted => "unstarted",
            TxState::InProgress => "in_progress",
            TxState::Unconfirmed => "unconfirmed",
            TxState::Confirmed => "confirmed",
            TxState::ConfirmedMissingReceipt => "confirmed_missing_receipt",
            TxState::FatalError => "fatal_error",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub id: Uuid,
    pub from: Address,
    pub to: Address,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    pub value: Wei,
    pub gas_limit: u64,
    /// Per-transaction gas price ceiling; the configured maximum applies when unset
    pub max_gas_price: Option<Wei>,
    pub nonce: Option<u64>,
    pub state: TxState,
    pub error: Option<String>,
    /// Append-only, oldest first
    pub attempt_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Tx {
    pub fn latest_attempt_id(&self) -> Option<Uuid> {
        self.attempt_ids.last().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    InProgress,
    Broadcast,
    InsufficientEth,
}

/// A signed artifact for a transaction at one gas price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAttempt {
    pub id: Uuid,
    pub tx_id: Uuid,
    #[serde(with = "hex_bytes")]
    pub signed_raw: Vec<u8>,
    pub gas_price: Wei,
    pub hash: H256,
    pub state: AttemptState,
    /// Head number first seen after this attempt was broadcast
    pub broadcast_before_block_num: Option<u64>,
    pub receipt_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Receipt of a mined attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_hash: H256,
    pub success: bool,
    pub gas_used: u64,
}
