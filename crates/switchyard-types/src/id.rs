//! Agent, router and cookie identifiers.

use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// First identifier handed out by the dynamic allocator.
///
/// Identifiers in `1..MIN_DYNAMIC_AGENT_ID` are reserved and can only be
/// claimed through router configuration.
pub const MIN_DYNAMIC_AGENT_ID: u64 = 4096;

// ---------------------------------------------------------------------------
// AgentId
// ---------------------------------------------------------------------------

/// Logical address of a client registered with a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u64);

impl AgentId {
    /// The router itself, or "no agent".
    pub const INVALID: AgentId = AgentId(0);

    /// Whether this is the `INVALID` sentinel.
    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }

    /// Whether this id falls in the range reserved for configured agents.
    pub fn is_reserved(self) -> bool {
        self.0 != 0 && self.0 < MIN_DYNAMIC_AGENT_ID
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for AgentId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

// ---------------------------------------------------------------------------
// RouterId
// ---------------------------------------------------------------------------

/// Random identity chosen by a router process at start-up.
///
/// Lets a client tell that the router it reconnects to is not the one that
/// issued its agent id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouterId(pub u64);

impl RouterId {
    /// "Unknown router", sent by clients that never registered.
    pub const UNKNOWN: RouterId = RouterId(0);

    /// Generate a fresh non-zero router id.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let v: u64 = rng.gen();
            if v != 0 {
                return Self(v);
            }
        }
    }

    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// MagicCookie
// ---------------------------------------------------------------------------

/// Shared secret proving ownership of an agent id across reconnections.
///
/// Serialized as 32 lowercase hex characters. `Debug` output is redacted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MagicCookie(pub [u8; MagicCookie::LEN]);

impl MagicCookie {
    /// Encoded length in bytes.
    pub const LEN: usize = 16;

    /// The all-zero cookie, meaning "no cookie".
    pub const NONE: MagicCookie = MagicCookie([0u8; Self::LEN]);

    /// Generate a random cookie.
    pub fn random() -> Self {
        let mut bytes = [0u8; Self::LEN];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    pub fn is_none(&self) -> bool {
        self.0 == [0u8; Self::LEN]
    }

    /// Constant-time comparison.
    pub fn matches(&self, other: &MagicCookie) -> bool {
        self.0.ct_eq(&other.0).into()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the 32-character hex form.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; Self::LEN];
        hex::decode_to_slice(s.trim(), &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for MagicCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            f.write_str("MagicCookie(none)")
        } else {
            f.write_str("MagicCookie(<redacted>)")
        }
    }
}

impl TryFrom<String> for MagicCookie {
    type Error = hex::FromHexError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<MagicCookie> for String {
    fn from(c: MagicCookie) -> Self {
        c.to_hex()
    }
}
