//! Chain identifiers and the registry of networks the client knows by name.
//!
//! Signing agents report the active chain as a hex quantity (`"0x13881"`).
//! [`ChainId`] normalizes that token so leading zeros and letter case never
//! produce a false mismatch against the required network.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque chain identifier as reported by a signing agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainId(u64);

impl ChainId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Error returned when a chain identifier token cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidChainId(pub String);

impl fmt::Display for InvalidChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid chain id: {:?}", self.0)
    }
}

impl std::error::Error for InvalidChainId {}

impl FromStr for ChainId {
    type Err = InvalidChainId;

    /// Accepts `0x`-prefixed hex (the EIP-1193 form) or plain decimal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => trimmed.parse::<u64>(),
        };
        parsed
            .map(ChainId)
            .map_err(|_| InvalidChainId(s.to_string()))
    }
}

impl TryFrom<String> for ChainId {
    type Error = InvalidChainId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChainId> for String {
    fn from(id: ChainId) -> Self {
        id.to_string()
    }
}

/// A chain identifier paired with its human-readable name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub chain_id: ChainId,
    pub name: String,
}

impl NetworkDescriptor {
    pub fn new(chain_id: ChainId, name: impl Into<String>) -> Self {
        Self {
            chain_id,
            name: name.into(),
        }
    }
}

impl fmt::Display for NetworkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.chain_id)
    }
}

/// Native currency advertised when registering a chain with an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// Everything an agent needs to add a chain it does not know yet.
///
/// Only used by the one-time registration fallback of a network switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRegistration {
    pub chain_id: ChainId,
    pub name: String,
    pub rpc_url: String,
    pub native_currency: NativeCurrency,
    pub explorer_url: String,
}

impl NetworkRegistration {
    pub fn descriptor(&self) -> NetworkDescriptor {
        NetworkDescriptor::new(self.chain_id, self.name.clone())
    }

    /// Polygon Mumbai Testnet, the network the portal contract is deployed on
    pub fn polygon_mumbai() -> Self {
        Self {
            chain_id: ChainId::new(0x13881),
            name: "Polygon Mumbai Testnet".to_string(),
            rpc_url: "https://rpc-mumbai.maticvigil.com".to_string(),
            native_currency: NativeCurrency {
                name: "MATIC".to_string(),
                symbol: "MATIC".to_string(),
                decimals: 18,
            },
            explorer_url: "https://mumbai.polygonscan.com".to_string(),
        }
    }
}

/// Result of mapping an agent-reported chain through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkStatus {
    Recognized(NetworkDescriptor),
    /// The chain is active in the agent but not known to this client
    Unrecognized(ChainId),
}

impl NetworkStatus {
    pub fn chain_id(&self) -> ChainId {
        match self {
            NetworkStatus::Recognized(descriptor) => descriptor.chain_id,
            NetworkStatus::Unrecognized(chain_id) => *chain_id,
        }
    }

    pub fn descriptor(&self) -> Option<&NetworkDescriptor> {
        match self {
            NetworkStatus::Recognized(descriptor) => Some(descriptor),
            NetworkStatus::Unrecognized(_) => None,
        }
    }

    pub fn is_chain(&self, chain_id: ChainId) -> bool {
        self.chain_id() == chain_id
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkStatus::Recognized(descriptor) => write!(f, "{}", descriptor),
            NetworkStatus::Unrecognized(chain_id) => {
                write!(f, "unrecognized network ({})", chain_id)
            }
        }
    }
}

/// Known networks, looked up by chain identifier.
#[derive(Debug, Clone)]
pub struct NetworkRegistry {
    networks: Vec<NetworkDescriptor>,
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        let networks = [
            (0x1, "Ethereum Mainnet"),
            (0x5, "Goerli Testnet"),
            (0xaa36a7, "Sepolia Testnet"),
            (0x89, "Polygon Mainnet"),
            (0x13881, "Polygon Mumbai Testnet"),
            (0x13882, "Polygon Amoy Testnet"),
            (0x7a69, "Localhost 8545"),
        ]
        .into_iter()
        .map(|(id, name)| NetworkDescriptor::new(ChainId::new(id), name))
        .collect();

        Self { networks }
    }
}

impl NetworkRegistry {
    pub fn new(networks: Vec<NetworkDescriptor>) -> Self {
        Self { networks }
    }

    /// Add or replace the entry for the descriptor's chain
    pub fn with(mut self, descriptor: NetworkDescriptor) -> Self {
        self.networks.retain(|n| n.chain_id != descriptor.chain_id);
        self.networks.push(descriptor);
        self
    }

    pub fn get(&self, chain_id: ChainId) -> Option<&NetworkDescriptor> {
        self.networks.iter().find(|n| n.chain_id == chain_id)
    }

    pub fn resolve(&self, chain_id: ChainId) -> NetworkStatus {
        match self.get(chain_id) {
            Some(descriptor) => NetworkStatus::Recognized(descriptor.clone()),
            None => NetworkStatus::Unrecognized(chain_id),
        }
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id_parsing_normalizes_hex() {
        let a: ChainId = "0x13881".parse().unwrap();
        let b: ChainId = "0x013881".parse().unwrap();
        let c: ChainId = "0X13881".parse().unwrap();
        let d: ChainId = "80001".parse().unwrap();

        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a, d);
        assert_eq!(a.to_string(), "0x13881");
    }

    #[test]
    fn test_chain_id_rejects_garbage() {
        assert!("0xzz".parse::<ChainId>().is_err());
        assert!("".parse::<ChainId>().is_err());
        assert!("mumbai".parse::<ChainId>().is_err());
    }

    #[test]
    fn test_chain_id_serializes_as_hex_string() {
        let json = serde_json::to_string(&ChainId::new(0x89)).unwrap();
        assert_eq!(json, "\"0x89\"");

        let back: ChainId = serde_json::from_str("\"0x89\"").unwrap();
        assert_eq!(back, ChainId::new(0x89));
    }

    #[test]
    fn test_registry_resolves_known_and_unknown() {
        let registry = NetworkRegistry::default();

        match registry.resolve(ChainId::new(0x89)) {
            NetworkStatus::Recognized(d) => assert_eq!(d.name, "Polygon Mainnet"),
            other => panic!("expected recognized network, got {:?}", other),
        }

        assert_eq!(
            registry.resolve(ChainId::new(0xdead)),
            NetworkStatus::Unrecognized(ChainId::new(0xdead))
        );
    }

    #[test]
    fn test_registry_with_replaces_entry() {
        let registry = NetworkRegistry::default()
            .with(NetworkDescriptor::new(ChainId::new(0x89), "Polygon PoS"));

        assert_eq!(registry.get(ChainId::new(0x89)).unwrap().name, "Polygon PoS");
        assert_eq!(registry.len(), NetworkRegistry::default().len());
    }

    #[test]
    fn test_mumbai_registration() {
        let mumbai = NetworkRegistration::polygon_mumbai();
        assert_eq!(mumbai.chain_id.to_string(), "0x13881");
        assert_eq!(mumbai.descriptor().name, "Polygon Mumbai Testnet");
        assert_eq!(mumbai.native_currency.decimals, 18);
    }
}
