use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Node configuration, loaded from TOML.
///
/// Every section and field is optional in the file; missing values take
/// their defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub keys: KeysSection,
    pub events: EventsSection,
    pub crawl: CrawlSection,
    pub repo: RepoSection,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub bind: SocketAddr,
    pub health_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 2583)),
            health_timeout_secs: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSection {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/carstore.sqlite`.
    pub db_path: Option<PathBuf>,
    pub prefetch: bool,
    pub prefetch_limit_bytes: u64,
    pub compact_min_shards: i64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            db_path: None,
            prefetch: true,
            prefetch_limit_bytes: 512 * 1024,
            compact_min_shards: 10,
        }
    }
}

impl StorageSection {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("carstore.sqlite"))
    }

    pub fn shards_dir(&self) -> PathBuf {
        self.data_dir.join("shards")
    }

    pub fn keystore_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeysSection {
    pub signing_ttl_secs: u64,
    pub encrypted_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Hex-encoded 32-byte key encrypting actor signing keys.
    pub master_key_hex: Option<String>,
    /// Hex-encoded secp256k1 directory rotation key.
    pub directory_key_hex: Option<String>,
    /// Directory server consulted for other actors' signing keys. Unset
    /// keeps an in-process directory.
    pub plc_url: Option<String>,
}

impl Default for KeysSection {
    fn default() -> Self {
        Self {
            signing_ttl_secs: 300,
            encrypted_ttl_secs: 3600,
            sweep_interval_secs: 30,
            master_key_hex: None,
            directory_key_hex: None,
            plc_url: None,
        }
    }
}

impl KeysSection {
    /// The master key, required to run a node.
    pub fn master_key(&self) -> ServerResult<[u8; 32]> {
        let encoded = self
            .master_key_hex
            .as_deref()
            .ok_or_else(|| ServerError::Config("keys.master_key_hex is not set".into()))?;
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| ServerError::Config(format!("keys.master_key_hex: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| ServerError::Config("keys.master_key_hex must be 32 bytes".into()))
    }

    pub fn directory_key(&self) -> ServerResult<Option<Vec<u8>>> {
        self.directory_key_hex
            .as_deref()
            .map(|encoded| {
                hex::decode(encoded.trim())
                    .map_err(|e| ServerError::Config(format!("keys.directory_key_hex: {e}")))
            })
            .transpose()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsSection {
    pub subscriber_buffer: usize,
    pub crossover_buffer: usize,
    /// Event log directory; events are kept in memory when unset.
    pub persist_dir: Option<PathBuf>,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            subscriber_buffer: 16_384,
            crossover_buffer: 512,
            persist_dir: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrawlSection {
    pub concurrency: usize,
    /// Repo fetches per second for hosts that declare no rate.
    pub default_crawl_rate: f64,
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            concurrency: 4,
            default_crawl_rate: 5.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepoSection {
    pub profile_collection: String,
}

impl Default for RepoSection {
    fn default() -> Self {
        Self {
            profile_collection: "com.example.profile".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml(text: &str) -> ServerResult<Self> {
        toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn to_toml(&self) -> ServerResult<String> {
        toml::to_string_pretty(self).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.server.health_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = NodeConfig::default();
        assert_eq!(c.server.bind, "127.0.0.1:2583".parse::<SocketAddr>().unwrap());
        assert_eq!(c.health_timeout(), Duration::from_secs(5));
        assert_eq!(c.storage.db_path(), PathBuf::from("./data/carstore.sqlite"));
        assert_eq!(c.events.subscriber_buffer, 16_384);
        assert_eq!(c.crawl.concurrency, 4);
        assert_eq!(c.repo.profile_collection, "com.example.profile");
        assert!(c.keys.master_key().is_err());
        assert_eq!(c.keys.plc_url, None);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c = NodeConfig::from_toml(
            r#"
            [storage]
            data_dir = "/var/lib/civpds"

            [keys]
            master_key_hex = "0101010101010101010101010101010101010101010101010101010101010101"
            "#,
        )
        .unwrap();
        assert_eq!(c.storage.db_path(), PathBuf::from("/var/lib/civpds/carstore.sqlite"));
        assert_eq!(c.storage.compact_min_shards, 10);
        assert_eq!(c.keys.master_key().unwrap(), [1u8; 32]);
        assert_eq!(c.keys.signing_ttl_secs, 300);
        assert_eq!(c.keys.plc_url, None);
    }

    #[test]
    fn plc_url_is_read() {
        let c = NodeConfig::from_toml("[keys]\nplc_url = \"https://plc.example\"\n").unwrap();
        assert_eq!(c.keys.plc_url.as_deref(), Some("https://plc.example"));
    }

    #[test]
    fn short_master_key_rejected() {
        let c = NodeConfig::from_toml("[keys]\nmaster_key_hex = \"abcd\"\n").unwrap();
        assert!(matches!(c.keys.master_key(), Err(ServerError::Config(_))));
    }

    #[test]
    fn toml_roundtrip() {
        let mut c = NodeConfig::default();
        c.crawl.concurrency = 9;
        c.events.persist_dir = Some(PathBuf::from("/tmp/events"));
        let text = c.to_toml().unwrap();
        assert_eq!(NodeConfig::from_toml(&text).unwrap(), c);
    }
}
