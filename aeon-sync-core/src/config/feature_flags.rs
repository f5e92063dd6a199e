//! Runtime feature switches for the sync pipeline

use serde::{Deserialize, Serialize};

/// Toggles for optional pipeline stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Encrypt queued operations and replica payloads
    pub encryption: bool,

    /// Compress outgoing batches
    pub compression: bool,

    /// Reduce operations to field-level deltas before sending
    pub delta_sync: bool,

    /// Require capability tokens on authenticated operations
    pub capability_verification: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self { encryption: false, compression: true, delta_sync: true, capability_verification: false }
    }
}

impl FeatureFlags {
    /// Look a flag up by name, `None` if the name is unknown
    pub fn get(&self, name: &str) -> Option<bool> {
        match name {
            "encryption" => Some(self.encryption),
            "compression" => Some(self.compression),
            "delta_sync" => Some(self.delta_sync),
            "capability_verification" => Some(self.capability_verification),
            _ => None,
        }
    }

    /// Set a flag by name, returns false if the name is unknown
    pub fn set(&mut self, name: &str, enabled: bool) -> bool {
        let slot = match name {
            "encryption" => &mut self.encryption,
            "compression" => &mut self.compression,
            "delta_sync" => &mut self.delta_sync,
            "capability_verification" => &mut self.capability_verification,
            _ => return false,
        };
        *slot = enabled;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags() {
        let flags = FeatureFlags::default();
        assert_eq!(flags.get("compression"), Some(true));
        assert_eq!(flags.get("encryption"), Some(false));
        assert_eq!(flags.get("teleport"), None);
    }

    #[test]
    fn test_set_flag() {
        let mut flags = FeatureFlags::default();
        assert!(flags.set("capability_verification", true));
        assert!(flags.capability_verification);
        assert!(!flags.set("teleport", true));
    }
}
