//! Configuration management for cryptmirror

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default Argon2id memory cost: 64 MiB
pub const DEFAULT_ARGON2_MEMORY_KIB: u32 = 64 * 1024;

/// Default Argon2id iteration count
pub const DEFAULT_ARGON2_ITERATIONS: u32 = 3;

/// Default Argon2id parallelism
pub const DEFAULT_ARGON2_PARALLELISM: u32 = 4;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Encryption configuration
    pub encryption: EncryptionConfig,

    /// Mount configuration
    pub mount: MountConfig,
}

/// Key derivation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 iteration count
    pub argon2_iterations: u32,

    /// Argon2 parallelism (lanes)
    pub argon2_parallelism: u32,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Filesystem name reported to the kernel
    pub fs_name: String,

    /// Allow other users to access the mount
    pub allow_other: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            argon2_memory_kib: DEFAULT_ARGON2_MEMORY_KIB,
            argon2_iterations: DEFAULT_ARGON2_ITERATIONS,
            argon2_parallelism: DEFAULT_ARGON2_PARALLELISM,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fs_name: "cryptmirror".to_string(),
            allow_other: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            encryption: EncryptionConfig::default(),
            mount: MountConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.encryption.argon2_iterations == 0 {
            return Err(Error::InvalidConfig(
                "Argon2 iteration count must be greater than 0".to_string(),
            ));
        }

        if self.encryption.argon2_parallelism == 0 {
            return Err(Error::InvalidConfig(
                "Argon2 parallelism must be greater than 0".to_string(),
            ));
        }

        // Argon2 requires at least 8 KiB of memory per lane
        if self.encryption.argon2_memory_kib < 8 * self.encryption.argon2_parallelism {
            return Err(Error::InvalidConfig(
                "Argon2 memory cost must be at least 8 KiB per lane".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.mount.fs_name = "mirrortest".to_string();
        config.encryption.argon2_iterations = 2;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.mount.fs_name, "mirrortest");
        assert_eq!(loaded.encryption.argon2_iterations, 2);
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let mut config = Config::default();
        config.encryption.argon2_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_memory_floor_enforced() {
        let mut config = Config::default();
        config.encryption.argon2_memory_kib = 4;
        config.encryption.argon2_parallelism = 1;
        assert!(config.validate().is_err());
    }
}
