//! Typed ID definitions for node resources.

use crate::define_id;

// =============================================================================
// Compute
// =============================================================================

// A VM shares its ID with the instance record that owns it.
define_id!(VmId, "vm");
define_id!(NodeId, "node");

// =============================================================================
// Storage
// =============================================================================

define_id!(DiskId, "dsk");
define_id!(ImageId, "img");

// =============================================================================
// Networking
// =============================================================================

define_id!(NetworkId, "vnet");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_vm_id_roundtrip() {
        let id = VmId::new();
        let s = id.to_string();
        assert!(s.starts_with("vm_"));
        let parsed: VmId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_disk_id_rejects_vm_prefix() {
        let result: Result<DiskId, _> = "vm_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        let err = result.unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<VmId, _> = "vm01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_empty() {
        let result: Result<VmId, _> = "".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<NetworkId, _> = "vnet_invalid".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidUlid(_)
        ));
    }

    #[test]
    fn test_json_uses_text_form() {
        let id: VmId = "vm_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"vm_01HV4Z2WQXKJNM8GPQY6VBKC3D\"");
        let parsed: VmId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = [
            VmId::PREFIX,
            NodeId::PREFIX,
            DiskId::PREFIX,
            ImageId::PREFIX,
            NetworkId::PREFIX,
        ];

        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn prop_display_parse_roundtrip(bits in any::<u128>()) {
            let id = DiskId::from_ulid(crate::Ulid(bits));
            let parsed: DiskId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
