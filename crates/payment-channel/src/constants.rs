use crate::error::ConfigError;

/// Chain ID of the local development chain (Hardhat / Anvil).
pub const LOCAL_CHAIN_ID: u64 = 31337;

/// EIP-712 domain name every channel signs under.
pub const EIP712_DOMAIN_NAME: &str = "PaymentChannel";

/// EIP-712 domain version every channel signs under.
pub const EIP712_DOMAIN_VERSION: &str = "1.0.0";

/// Runtime chain configuration. Decouples the signature domain from
/// compile-time constants so the same channel code can run on any chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub eip712_domain_name: String,
    pub eip712_domain_version: String,
}

impl Default for ChainConfig {
    /// Defaults to the local development chain.
    fn default() -> Self {
        Self {
            chain_id: LOCAL_CHAIN_ID,
            eip712_domain_name: EIP712_DOMAIN_NAME.to_string(),
            eip712_domain_version: EIP712_DOMAIN_VERSION.to_string(),
        }
    }
}

impl ChainConfig {
    /// Config for an arbitrary chain ID with the standard channel domain.
    pub fn for_chain(chain_id: u64) -> Self {
        Self {
            chain_id,
            ..Self::default()
        }
    }

    /// Build a config from `CHAIN_ID`, `EIP712_DOMAIN_NAME` and
    /// `EIP712_DOMAIN_VERSION`. Unset variables fall back to the defaults;
    /// a set but unparsable `CHAIN_ID` is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let chain_id = match std::env::var("CHAIN_ID") {
            Ok(raw) => raw.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
                var: "CHAIN_ID",
                reason: e.to_string(),
            })?,
            Err(_) => defaults.chain_id,
        };

        let eip712_domain_name = std::env::var("EIP712_DOMAIN_NAME")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.eip712_domain_name);

        let eip712_domain_version = std::env::var("EIP712_DOMAIN_VERSION")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.eip712_domain_version);

        if eip712_domain_name != EIP712_DOMAIN_NAME || eip712_domain_version != EIP712_DOMAIN_VERSION
        {
            tracing::warn!(
                name = %eip712_domain_name,
                version = %eip712_domain_version,
                "non-standard EIP-712 domain configured; signatures from standard wallets will not verify"
            );
        }

        Ok(Self {
            chain_id,
            eip712_domain_name,
            eip712_domain_version,
        })
    }
}
