//! Host bridge assignment for veth ends.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::config::Config;

/// Tracks which host bridge each veth end is attached to.
///
/// New ends go to the least-loaded candidate bridge; ties go to the bridge
/// listed first. An end that is already registered keeps its bridge.
#[derive(Debug)]
pub struct InterfaceRegistry {
    external_bridges: Vec<String>,
    internal_bridges: Vec<String>,
    overlay_bridge: String,
    assignments: Mutex<HashMap<String, String>>,
}

impl InterfaceRegistry {
    pub fn new(
        external_bridges: Vec<String>,
        internal_bridges: Vec<String>,
        overlay_bridge: impl Into<String>,
    ) -> Self {
        Self {
            external_bridges,
            internal_bridges,
            overlay_bridge: overlay_bridge.into(),
            assignments: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.external_bridges.clone(),
            config.internal_bridges.clone(),
            config.overlay_bridge.clone(),
        )
    }

    /// Bridge for an external veth end.
    pub fn external(&self, virt: &str) -> Option<String> {
        self.assign(virt, &self.external_bridges)
    }

    /// Bridge for an internal veth end. With the overlay every internal end
    /// shares the overlay bridge.
    pub fn internal(&self, virt: &str, overlay: bool) -> Option<String> {
        if overlay {
            return self.assign(virt, std::slice::from_ref(&self.overlay_bridge));
        }
        self.assign(virt, &self.internal_bridges)
    }

    pub fn bridge_of(&self, virt: &str) -> Option<String> {
        self.assignments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(virt)
            .cloned()
    }

    pub fn remove(&self, virt: &str) {
        self.assignments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(virt);
    }

    fn assign(&self, virt: &str, candidates: &[String]) -> Option<String> {
        let mut assignments = self
            .assignments
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(bridge) = assignments.get(virt) {
            if candidates.contains(bridge) {
                return Some(bridge.clone());
            }
        }

        let bridge = candidates
            .iter()
            .min_by_key(|candidate| {
                assignments
                    .values()
                    .filter(|assigned| assigned == candidate)
                    .count()
            })?
            .clone();

        assignments.insert(virt.to_string(), bridge.clone());
        Some(bridge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> InterfaceRegistry {
        InterfaceRegistry::new(
            vec!["br0".to_string(), "br1".to_string()],
            vec!["brint".to_string()],
            "brvx0",
        )
    }

    #[test]
    fn test_least_loaded_external() {
        let registry = registry();
        assert_eq!(registry.external("k0a").as_deref(), Some("br0"));
        assert_eq!(registry.external("k0b").as_deref(), Some("br1"));
        assert_eq!(registry.external("k0c").as_deref(), Some("br0"));

        registry.remove("k0b");
        assert_eq!(registry.external("k0d").as_deref(), Some("br1"));
    }

    #[test]
    fn test_assignment_is_sticky() {
        let registry = registry();
        assert_eq!(registry.external("k0a").as_deref(), Some("br0"));
        assert_eq!(registry.external("k0a").as_deref(), Some("br0"));
        assert_eq!(registry.bridge_of("k0a").as_deref(), Some("br0"));
    }

    #[test]
    fn test_overlay_internal_bridge() {
        let registry = registry();
        assert_eq!(registry.internal("k1a", false).as_deref(), Some("brint"));
        assert_eq!(registry.internal("k1b", true).as_deref(), Some("brvx0"));
    }

    #[test]
    fn test_no_candidates() {
        let registry = InterfaceRegistry::new(Vec::new(), Vec::new(), "brvx0");
        assert_eq!(registry.external("k0a"), None);
        assert_eq!(registry.bridge_of("k0a"), None);
    }
}
