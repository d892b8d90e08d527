//! Delivery settings for session controllers.

use crate::error::{DeliveryError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Knobs for running a single item session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ItemSessionControllerSettings {
    /// Maximum template-processing runs before giving up and keeping
    /// defaults (default: 100).
    pub template_processing_limit: u32,

    /// Maximum committed attempts for non-adaptive items; 0 means unlimited
    /// (default: 0).
    pub max_attempts: u32,
}

impl Default for ItemSessionControllerSettings {
    fn default() -> Self {
        Self {
            template_processing_limit: 100,
            max_attempts: 0,
        }
    }
}

/// Knobs for running a test session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TestSessionControllerSettings {
    /// Template-processing limit applied to the items of the test
    /// (default: 100).
    pub template_processing_limit: u32,
}

impl Default for TestSessionControllerSettings {
    fn default() -> Self {
        Self {
            template_processing_limit: 100,
        }
    }
}

impl TestSessionControllerSettings {
    /// Item-level settings derived for items running inside a test.
    pub fn item_settings(&self) -> ItemSessionControllerSettings {
        ItemSessionControllerSettings {
            template_processing_limit: self.template_processing_limit,
            max_attempts: 0,
        }
    }
}

/// Combined settings, as persisted in a delivery settings file.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeliverySettings {
    /// Item session settings.
    #[serde(default)]
    pub item: ItemSessionControllerSettings,
    /// Test session settings.
    #[serde(default)]
    pub test: TestSessionControllerSettings,
}

impl DeliverySettings {
    /// Loads settings from `dir/delivery.toml`, defaults if absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("delivery.toml");
        if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| DeliveryError::Settings(format!("failed to read settings: {e}")))?;
            toml::from_str(&content)
                .map_err(|e| DeliveryError::Settings(format!("failed to parse settings: {e}")))
        } else {
            Ok(Self::default())
        }
    }

    /// Saves settings to `dir/delivery.toml`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join("delivery.toml");
        let content = toml::to_string_pretty(self)
            .map_err(|e| DeliveryError::Settings(format!("failed to serialize settings: {e}")))?;
        fs::write(&path, content)
            .map_err(|e| DeliveryError::Settings(format!("failed to write settings: {e}")))?;
        Ok(())
    }
}
