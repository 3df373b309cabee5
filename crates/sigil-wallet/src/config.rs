//! Engine configuration.
//!
//! Layers, lowest first: built-in defaults, an optional TOML file, then
//! environment variables prefixed `SIGIL_` (nested keys use `__`, e.g.
//! `SIGIL_KDF__ITERATIONS=4`).

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use sigil_core::constants::{DUST_LIMIT, GAP_LIMIT, MAX_COSIGNERS};
use sigil_core::error::{SigilError, ValidationError};

use crate::coin_selection::SelectionPolicy;
use crate::encryption::KdfParams;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SIGIL";

/// Default coin-selection behaviour.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub privacy_randomize: bool,
    pub min_confirmations: u32,
    /// Upper bound on one selection run, in milliseconds. Zero disables it.
    pub timeout_ms: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            privacy_randomize: false,
            min_confirmations: 0,
            timeout_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub network: Network,
    pub gap_limit: u32,
    pub max_cosigners: usize,
    pub kdf: KdfParams,
    pub dust_limit: u64,
    pub selection: SelectionConfig,
    /// Seconds of inactivity before the host should lock. Zero disables it.
    pub idle_timeout_secs: u64,
    /// Upper bound on an unlock attempt, in seconds.
    pub unlock_timeout_secs: u64,
    /// Root directory; each network gets its own subdirectory.
    pub data_dir: PathBuf,
    /// Wallet file name inside the network directory, or an absolute path.
    pub wallet_file: String,
    /// Log filter string (e.g. "info", "sigil_wallet=debug").
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sigil");

        Self {
            network: Network::Bitcoin,
            gap_limit: GAP_LIMIT,
            max_cosigners: MAX_COSIGNERS,
            kdf: KdfParams::default(),
            dust_limit: DUST_LIMIT,
            selection: SelectionConfig::default(),
            idle_timeout_secs: 300,
            unlock_timeout_secs: 30,
            data_dir,
            wallet_file: "wallet.sgwl".to_string(),
            log_level: "info".to_string(),
        }
    }
}

fn invalid(e: impl ToString) -> SigilError {
    ValidationError::InvalidConfig(e.to_string()).into()
}

impl EngineConfig {
    /// Load defaults, then `file` if given and present, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, SigilError> {
        Self::load_with_env(file, None)
    }

    fn load_with_env(file: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self, SigilError> {
        let defaults = config::Config::try_from(&Self::default()).map_err(invalid)?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .source(env),
        );

        let cfg: Self = builder
            .build()
            .map_err(invalid)?
            .try_deserialize()
            .map_err(invalid)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), SigilError> {
        if self.gap_limit == 0 {
            return Err(invalid("gap_limit must be at least 1"));
        }
        if self.max_cosigners == 0 || self.max_cosigners > MAX_COSIGNERS {
            return Err(invalid(format!("max_cosigners must be within 1..={MAX_COSIGNERS}")));
        }
        if self.kdf.iterations == 0 || self.kdf.parallelism == 0 {
            return Err(invalid("kdf iterations and parallelism must be non-zero"));
        }
        if self.dust_limit == 0 {
            return Err(invalid("dust_limit must be non-zero"));
        }
        Ok(())
    }

    /// Directory holding this network's wallet files.
    pub fn network_dir(&self) -> PathBuf {
        self.data_dir.join(self.network.to_core_arg())
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.network_dir().join(&self.wallet_file)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn unlock_timeout(&self) -> Duration {
        Duration::from_secs(self.unlock_timeout_secs)
    }

    /// Selection policy for one run starting now.
    pub fn selection_policy(&self) -> SelectionPolicy {
        let deadline = match self.selection.timeout_ms {
            0 => None,
            ms => Some(Instant::now() + Duration::from_millis(ms)),
        };
        SelectionPolicy {
            privacy_randomize: self.selection.privacy_randomize,
            min_confirmations: self.selection.min_confirmations,
            dust_limit: self.dust_limit,
            deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.gap_limit, 20);
        assert_eq!(cfg.max_cosigners, 15);
        assert_eq!(cfg.dust_limit, 546);
        assert_eq!(cfg.kdf, KdfParams::default());
        assert!(cfg.data_dir.ends_with("sigil"));
        cfg.validate().unwrap();
    }

    #[test]
    fn wallet_path_is_per_network() {
        let cfg = EngineConfig {
            network: Network::Testnet,
            data_dir: PathBuf::from("/tmp/sigil-test"),
            ..EngineConfig::default()
        };
        assert_eq!(cfg.wallet_path(), PathBuf::from("/tmp/sigil-test/testnet/wallet.sgwl"));
    }

    #[test]
    fn absolute_wallet_file_wins() {
        let cfg = EngineConfig {
            wallet_file: "/srv/keys/main.sgwl".into(),
            ..EngineConfig::default()
        };
        assert_eq!(cfg.wallet_path(), PathBuf::from("/srv/keys/main.sgwl"));
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "network = \"regtest\"\ngap_limit = 5\n\n[kdf]\nmemory_kib = 1024\niterations = 1\nparallelism = 1\n\n[selection]\nprivacy_randomize = true"
        )
        .unwrap();

        let cfg = EngineConfig::load_with_env(Some(file.path()), Some(config::Map::new())).unwrap();
        assert_eq!(cfg.network, Network::Regtest);
        assert_eq!(cfg.gap_limit, 5);
        assert_eq!(cfg.kdf, KdfParams::light());
        assert!(cfg.selection.privacy_randomize);
        assert_eq!(cfg.max_cosigners, 15);
    }

    #[test]
    fn environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "gap_limit = 5").unwrap();

        let mut env = config::Map::new();
        env.insert("SIGIL_GAP_LIMIT".to_string(), "7".to_string());
        env.insert("SIGIL_NETWORK".to_string(), "signet".to_string());
        env.insert("SIGIL_KDF__ITERATIONS".to_string(), "4".to_string());

        let cfg = EngineConfig::load_with_env(Some(file.path()), Some(env)).unwrap();
        assert_eq!(cfg.gap_limit, 7);
        assert_eq!(cfg.network, Network::Signet);
        assert_eq!(cfg.kdf.iterations, 4);
    }

    #[test]
    fn missing_file_is_ignored() {
        let cfg = EngineConfig::load_with_env(Some(Path::new("/nonexistent/sigil.toml")), Some(config::Map::new())).unwrap();
        assert_eq!(cfg.gap_limit, GAP_LIMIT);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut env = config::Map::new();
        env.insert("SIGIL_GAP_LIMIT".to_string(), "0".to_string());
        assert!(matches!(
            EngineConfig::load_with_env(None, Some(env)).unwrap_err(),
            SigilError::Validation(ValidationError::InvalidConfig(_))
        ));

        let cfg = EngineConfig {
            max_cosigners: 16,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn selection_policy_carries_dust_and_deadline() {
        let cfg = EngineConfig {
            dust_limit: 1_000,
            ..EngineConfig::default()
        };
        let policy = cfg.selection_policy();
        assert_eq!(policy.dust_limit, 1_000);
        assert!(policy.deadline.is_some());

        let no_deadline = EngineConfig {
            selection: SelectionConfig { timeout_ms: 0, ..SelectionConfig::default() },
            ..EngineConfig::default()
        };
        assert!(no_deadline.selection_policy().deadline.is_none());
    }
}
