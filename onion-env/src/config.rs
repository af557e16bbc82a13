//! 环境配置。
//!
//! 所有字段都有默认值，不提供配置文件也能直接使用：
//!
//! ```json
//! { "initial_pages": 16, "maximum_pages": 16384, "shared_memory": false,
//!   "reserved_bytes": 1024, "features": { "finalization": true } }
//! ```

use onion_host::HostFeatures;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "serde_support")]
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde_support", serde(default))]
pub struct EnvConfig {
    /// 线性内存初始页数（每页 64 KiB）
    pub initial_pages: u32,
    pub maximum_pages: u32,
    pub shared_memory: bool,
    /// 线性内存开头不参与分配的字节数
    pub reserved_bytes: usize,
    pub features: HostFeatures,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            initial_pages: 16,
            maximum_pages: 16384,
            shared_memory: false,
            reserved_bytes: 1024,
            features: HostFeatures::default(),
        }
    }
}

impl EnvConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_pages == 0 {
            return Err(ConfigError::Invalid("initial_pages must be at least 1".into()));
        }
        if self.initial_pages > self.maximum_pages {
            return Err(ConfigError::Invalid(format!(
                "initial_pages ({}) exceeds maximum_pages ({})",
                self.initial_pages, self.maximum_pages
            )));
        }
        // wasm32 地址空间上限
        if self.maximum_pages > 65536 {
            return Err(ConfigError::Invalid(format!(
                "maximum_pages ({}) exceeds 65536",
                self.maximum_pages
            )));
        }
        if self.reserved_bytes >= self.initial_pages as usize * onion_host::PAGE_SIZE {
            return Err(ConfigError::Invalid(
                "reserved_bytes leaves no room for allocations".into(),
            ));
        }
        Ok(())
    }

    #[cfg(feature = "serde_support")]
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: EnvConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "serde_support")]
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
