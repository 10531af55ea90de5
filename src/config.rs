//! Image and swap configuration
//!
//! Values are read once, when the tiled storage subsystem starts. Sources
//! are layered: built-in defaults, then an optional TOML file, then
//! `TILEVAULT_*` environment variables.
//!
//! ```toml
//! max_swap_size = 4294967296
//! swap_slab_size = 67108864
//! swap_window_size = 16777216
//! swap_dir = "/var/tmp"
//! memory_limit = 1073741824
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;

/// Settings for tiled storage and swapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Upper bound on the swap address space (bytes)
    pub max_swap_size: u64,
    /// Size of a swap slab (bytes)
    pub swap_slab_size: u64,
    /// Size of the mapped swap window (bytes)
    pub swap_window_size: u64,
    /// Directory that receives the swap file
    pub swap_dir: PathBuf,
    /// Resident tile bytes allowed before tiles are swapped out
    pub memory_limit: u64,
    /// Pixels along one tile edge
    pub tile_size: u32,
    /// zstd level used for swapped tiles
    pub compression_level: i32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_swap_size: 4096 * MIB,
            swap_slab_size: 64 * MIB,
            swap_window_size: 16 * MIB,
            swap_dir: std::env::temp_dir(),
            memory_limit: 1024 * MIB,
            tile_size: 64,
            compression_level: 1,
        }
    }
}

impl ImageConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ImageConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&ImageConfig::default())
            .map_err(|e| Error::Config(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(config::Environment::with_prefix("TILEVAULT"));

        let config: ImageConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the swap layer cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_swap_size == 0 || self.swap_slab_size == 0 || self.swap_window_size == 0 {
            return Err(Error::Config("swap sizes must be non-zero".to_string()));
        }
        if self.swap_slab_size > self.max_swap_size {
            return Err(Error::Config(format!(
                "swap slab size {} exceeds maximum swap size {}",
                self.swap_slab_size, self.max_swap_size
            )));
        }
        if self.tile_size == 0 {
            return Err(Error::Config("tile size must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ImageConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.swap_slab_size, 64 * MIB);
        assert_eq!(config.tile_size, 64);
    }

    #[test]
    fn test_from_toml_partial() -> Result<()> {
        let config = ImageConfig::from_toml_str(
            r#"
            swap_slab_size = 4096
            swap_window_size = 8192
            swap_dir = "/tmp/tiles"
            "#,
        )?;
        assert_eq!(config.swap_slab_size, 4096);
        assert_eq!(config.swap_window_size, 8192);
        assert_eq!(config.swap_dir, PathBuf::from("/tmp/tiles"));
        assert_eq!(config.max_swap_size, 4096 * MIB);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(ImageConfig::from_toml_str("swap_slab_size = 0").is_err());
        assert!(ImageConfig::from_toml_str("max_swap_size = 10\nswap_slab_size = 20").is_err());
        assert!(ImageConfig::from_toml_str("tile_size = \"big\"").is_err());
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tilevault.toml");
        std::fs::write(&path, "memory_limit = 12345\ntile_size = 32\n")?;

        let config = ImageConfig::load(Some(&path))?;
        assert_eq!(config.memory_limit, 12345);
        assert_eq!(config.tile_size, 32);
        assert_eq!(config.swap_window_size, 16 * MIB);
        Ok(())
    }
}
