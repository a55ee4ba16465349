//! Registry sizing configuration.

use serde::{Deserialize, Serialize};

fn default_id_limit() -> u32 {
    u32::MAX
}

/// Limits applied by the object pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Exclusive upper bound on allocated ids.
    #[serde(default = "default_id_limit")]
    pub id_limit: u32,

    /// Maximum number of simultaneously live objects. Unbounded if not specified.
    #[serde(default)]
    pub max_objects: Option<usize>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            id_limit: default_id_limit(),
            max_objects: None,
        }
    }
}

impl RegistryConfig {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.id_limit == 0 {
            errors.push("id-limit must be at least 1.".to_owned());
        }
        if self.max_objects == Some(0) {
            errors.push("max-objects must be at least 1 when specified.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
