//! MTU budget for jumbo frames and VLAN-over-VXLAN overlays.

use crate::NetworkError;

/// Minimum MTU for IPv6.
pub const MTU_MIN_IPV6: u16 = 1280;

/// Maximum MTU for jumbo frames.
pub const MTU_MAX_JUMBO: u16 = 9000;

/// Default MTU for Ethernet.
pub const MTU_DEFAULT_ETHERNET: u16 = 1500;

/// Bytes consumed by the outer VXLAN encapsulation.
pub const OVERLAY_OVERHEAD: u16 = 50;

/// Bytes consumed by the 802.1Q tag on the VLAN sub-interface.
pub const VLAN_OVERHEAD: u16 = 4;

/// Validate an MTU value.
pub fn validate_mtu(mtu: u16) -> Result<u16, NetworkError> {
    if !(MTU_MIN_IPV6..=MTU_MAX_JUMBO).contains(&mtu) {
        return Err(NetworkError::InvalidMtu {
            value: mtu,
            min: MTU_MIN_IPV6,
            max: MTU_MAX_JUMBO,
        });
    }
    Ok(mtu)
}

/// MTU values applied to one VM's interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtuPlan {
    /// External veth pair (both ends).
    pub external: u16,

    /// Host-management veth pair (both ends).
    pub host: u16,

    /// Internal veth pair (both ends).
    pub internal: u16,

    /// Instance tap, VLAN sub-interface and in-namespace bridge.
    pub instance: u16,
}

impl MtuPlan {
    /// Resolve the plan for the node's frame and overlay settings.
    ///
    /// Returns `None` when neither jumbo frames nor the overlay are enabled;
    /// interfaces then keep their kernel defaults and no command is issued.
    pub fn resolve(
        jumbo_frames: bool,
        overlay: bool,
        jumbo_mtu: u16,
        normal_mtu: u16,
    ) -> Result<Option<Self>, NetworkError> {
        if !jumbo_frames && !overlay {
            return Ok(None);
        }

        let base = validate_mtu(if jumbo_frames { jumbo_mtu } else { normal_mtu })?;
        let (internal, instance) = if overlay {
            let internal = validate_mtu(base.saturating_sub(OVERLAY_OVERHEAD))?;
            (internal, validate_mtu(internal.saturating_sub(VLAN_OVERHEAD))?)
        } else {
            (base, base)
        };

        Ok(Some(Self {
            external: base,
            host: base,
            internal,
            instance,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_mtu_validation() {
        assert!(validate_mtu(1280).is_ok());
        assert!(validate_mtu(1500).is_ok());
        assert!(validate_mtu(9000).is_ok());

        assert!(validate_mtu(1279).is_err());
        assert!(validate_mtu(9001).is_err());
    }

    #[rstest]
    #[case::jumbo_overlay(true, true, 9000, 8950, 8946)]
    #[case::overlay_only(false, true, 1500, 1450, 1446)]
    #[case::jumbo_only(true, false, 9000, 9000, 9000)]
    fn test_mtu_plan(
        #[case] jumbo: bool,
        #[case] overlay: bool,
        #[case] external: u16,
        #[case] internal: u16,
        #[case] instance: u16,
    ) {
        let plan = MtuPlan::resolve(jumbo, overlay, 9000, 1500)
            .unwrap()
            .unwrap();
        assert_eq!(plan.external, external);
        assert_eq!(plan.host, external);
        assert_eq!(plan.internal, internal);
        assert_eq!(plan.instance, instance);
    }

    #[test]
    fn test_mtu_plan_untouched_without_jumbo_or_overlay() {
        assert_eq!(MtuPlan::resolve(false, false, 9000, 1500).unwrap(), None);
    }

    #[test]
    fn test_mtu_plan_rejects_undersized_base() {
        assert!(MtuPlan::resolve(false, true, 9000, 1300).is_err());
    }
}
