//! # Configuration
//!
//! Image identity and arena growth policy. Defaults match the running build;
//! a TOML file can override them (loaded once at startup).
//!
//! ```toml
//! [image]
//! filetype_tag = "LIPI"
//! session_id = 65539
//!
//! [arena]
//! initial_list_capacity = 64
//! list_growth_factor = 2
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use clump_reflect::FourCc;

use crate::error::{ClumpError, ClumpResult};
use crate::image::format::{IMAGE_FILETYPE_TAG, SESSION_ID};

/// Identity stamped into and required from every image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Constant image marker.
    pub filetype_tag: FourCc,
    /// Session constant of the running process. Images from another session are rejected.
    pub session_id: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            filetype_tag: IMAGE_FILETYPE_TAG,
            session_id: SESSION_ID,
        }
    }
}

/// Growth policy of object lists and containers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Slots in the first object list of each type.
    pub initial_list_capacity: u32,
    /// Each new list of a type is this many times larger than the previous one.
    pub list_growth_factor: u32,
    /// Upper bound on the slots of a single list.
    pub max_list_capacity: u32,
    /// Initial capacity of the list-header vector.
    pub initial_list_slots: u32,
    /// Capacity of a container's first backing block.
    pub initial_container_capacity: u32,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_list_capacity: 16,
            list_growth_factor: 2,
            max_list_capacity: 1 << 20,
            initial_list_slots: 4,
            initial_container_capacity: 4,
        }
    }
}

/// Complete configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClumpConfig {
    /// Image identity.
    pub image: ImageConfig,
    /// Arena growth policy.
    pub arena: ArenaConfig,
}

impl ClumpConfig {
    /// Parses a configuration from TOML text. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// [`ClumpError::InvalidConfig`] on a parse error or an unusable value.
    pub fn from_toml_str(text: &str) -> ClumpResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ClumpError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    ///
    /// # Errors
    ///
    /// [`ClumpError::InvalidConfig`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> ClumpResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ClumpError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks that the growth policy can make progress.
    ///
    /// # Errors
    ///
    /// [`ClumpError::InvalidConfig`] naming the offending key.
    pub fn validate(&self) -> ClumpResult<()> {
        let arena = &self.arena;
        if arena.initial_list_capacity == 0 {
            return Err(ClumpError::InvalidConfig("initial_list_capacity must be > 0".into()));
        }
        if arena.list_growth_factor == 0 {
            return Err(ClumpError::InvalidConfig("list_growth_factor must be > 0".into()));
        }
        if arena.max_list_capacity < arena.initial_list_capacity {
            return Err(ClumpError::InvalidConfig(
                "max_list_capacity must be >= initial_list_capacity".into(),
            ));
        }
        if arena.initial_list_slots == 0 || arena.initial_container_capacity == 0 {
            return Err(ClumpError::InvalidConfig(
                "initial_list_slots and initial_container_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ClumpConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ClumpConfig::from_toml_str(
            r#"
            [arena]
            initial_list_capacity = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.arena.initial_list_capacity, 64);
        assert_eq!(config.arena.list_growth_factor, 2);
        assert_eq!(config.image, ImageConfig::default());
    }

    #[test]
    fn test_toml_overrides_image_identity() {
        let config = ClumpConfig::from_toml_str(
            r#"
            [image]
            filetype_tag = "TEST"
            session_id = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.image.filetype_tag, FourCc::new(b"TEST"));
        assert_eq!(config.image.session_id, 7);
    }

    #[test]
    fn test_zero_growth_rejected() {
        let err = ClumpConfig::from_toml_str("[arena]\nlist_growth_factor = 0\n").unwrap_err();
        assert!(matches!(err, ClumpError::InvalidConfig(_)));
    }

    #[test]
    fn test_bad_fourcc_rejected() {
        let err = ClumpConfig::from_toml_str("[image]\nfiletype_tag = \"TOOLONG\"\n").unwrap_err();
        assert!(matches!(err, ClumpError::InvalidConfig(_)));
    }
}
