use alloy_primitives::Address;
use common::networks::NetworkRegistration;
use serde::{Deserialize, Serialize};
use std::path::Path;
use wave_client::{ContractConfig, PortalSettings, RpcWalletConfig};

/// Deployed portal contract on Polygon Mumbai
pub const DEFAULT_CONTRACT_ADDRESS: &str = "0x8445aAf2475d044ccDa690f286d40d296253Ec6A";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    pub agent: RpcWalletConfig,
    pub contract_address: String,
    pub required_network: NetworkRegistration,
    pub polling: ContractConfig,
    #[serde(default)]
    pub auto_switch: bool,
}

impl PortalConfig {
    pub async fn load_from_file(path: &Path) -> eyre::Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Load `portal.json` from `config_dir`, falling back to defaults
    pub async fn load(config_dir: &Path) -> eyre::Result<Self> {
        let path = config_dir.join("portal.json");
        let config = if path.exists() {
            Self::load_from_file(&path).await?
        } else {
            tracing::warn!(path = %path.display(), "portal.json not found, using defaults");
            Self::default()
        };
        Ok(config.with_env_overrides())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("WAVE_AGENT_URL") {
            self.agent.url = url;
        }
        if let Ok(address) = std::env::var("WAVE_CONTRACT_ADDRESS") {
            self.contract_address = address;
        }
        if let Some(poll_ms) = std::env::var("WAVE_AGENT_POLL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.agent.notification_poll_ms = poll_ms;
        }
        self
    }

    pub fn contract(&self) -> eyre::Result<Address> {
        self.contract_address
            .parse()
            .map_err(|e| eyre::eyre!("Invalid contract address {}: {}", self.contract_address, e))
    }

    pub fn settings(&self) -> eyre::Result<PortalSettings> {
        Ok(PortalSettings {
            contract: self.contract()?,
            required_network: self.required_network.clone(),
            contract_config: self.polling.clone(),
            auto_switch: self.auto_switch,
        })
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            agent: RpcWalletConfig::default(),
            contract_address: DEFAULT_CONTRACT_ADDRESS.to_string(),
            required_network: NetworkRegistration::polygon_mumbai(),
            polling: ContractConfig::default(),
            auto_switch: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = PortalConfig::default().settings().unwrap();
        assert_eq!(settings.contract, DEFAULT_CONTRACT_ADDRESS.parse::<Address>().unwrap());
        assert_eq!(settings.required_network.chain_id.to_string(), "0x13881");
        assert!(!settings.auto_switch);
    }

    #[test]
    fn test_invalid_contract_address() {
        let config = PortalConfig {
            contract_address: "0xnope".to_string(),
            ..Default::default()
        };
        assert!(config.settings().is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("wave-portal-config-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("portal.json");

        let mut config = PortalConfig::default();
        config.auto_switch = true;
        config.polling.log_poll_ms = 250;
        tokio::fs::write(&path, serde_json::to_string_pretty(&config).unwrap())
            .await
            .unwrap();

        let loaded = PortalConfig::load_from_file(&path).await.unwrap();
        assert!(loaded.auto_switch);
        assert_eq!(loaded.polling.log_poll_ms, 250);
        assert_eq!(loaded.required_network.native_currency.symbol, "MATIC");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
