//! Type-safe wrappers for membership primitives.
//!
//! These newtypes keep join orders, ensemble sequence numbers and product versions
//! from being mixed up with plain integers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::UNASSIGNED_ORDER;

/// Cluster-unique node identifier.
pub type NodeId = Uuid;

/// A node's position in the cluster-wide join order.
///
/// Join orders start at 1. Order 0 means "not yet assigned": it is what a local node
/// carries before its join transaction commits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeOrder(pub u64);

impl NodeOrder {
    /// Placeholder for a node that has not joined yet.
    pub const UNASSIGNED: Self = NodeOrder(UNASSIGNED_ORDER);

    /// Create a join order from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        NodeOrder(value)
    }

    /// Join order for the liveness marker that got ensemble sequence `sequence`.
    ///
    /// The first marker (sequence 0) gets order 1.
    #[inline]
    pub const fn from_sequence(sequence: u64) -> Self {
        NodeOrder(sequence + 1)
    }

    /// Ensemble sequence number this order was derived from, if assigned.
    #[inline]
    pub const fn sequence(self) -> Option<u64> {
        match self.0 {
            UNASSIGNED_ORDER => None,
            order => Some(order - 1),
        }
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Check if an order has been assigned.
    #[inline]
    pub const fn is_assigned(self) -> bool {
        self.0 != UNASSIGNED_ORDER
    }
}

impl From<u64> for NodeOrder {
    fn from(value: u64) -> Self {
        NodeOrder(value)
    }
}

impl From<NodeOrder> for u64 {
    fn from(order: NodeOrder) -> Self {
        order.0
    }
}

impl fmt::Display for NodeOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Software version a node runs, exchanged at join time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ProductVersion {
    pub major: u16,
    pub minor: u16,
    pub maintenance: u16,
}

impl ProductVersion {
    pub const fn new(major: u16, minor: u16, maintenance: u16) -> Self {
        Self {
            major,
            minor,
            maintenance,
        }
    }

    /// Version of this crate.
    pub fn current() -> Self {
        env!("CARGO_PKG_VERSION").parse().unwrap_or_default()
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.maintenance)
    }
}

impl FromStr for ProductVersion {
    type Err = String;

    /// Parses `major.minor.maintenance`, ignoring any `-suffix`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let core = s.split(['-', '+']).next().unwrap_or_default();
        let mut parts = core.split('.');
        let mut next = |name: &str| -> Result<u16, String> {
            parts
                .next()
                .ok_or_else(|| format!("missing {} component in version '{}'", name, s))?
                .parse()
                .map_err(|e| format!("invalid {} component in version '{}': {}", name, s, e))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let maintenance = next("maintenance")?;
        Ok(Self::new(major, minor, maintenance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_from_sequence_is_offset_by_one() {
        assert_eq!(NodeOrder::from_sequence(0), NodeOrder(1));
        assert_eq!(NodeOrder::from_sequence(41), NodeOrder(42));
        assert_eq!(NodeOrder(42).sequence(), Some(41));
    }

    #[test]
    fn test_unassigned_order() {
        assert!(!NodeOrder::UNASSIGNED.is_assigned());
        assert_eq!(NodeOrder::UNASSIGNED.sequence(), None);
        assert_eq!(NodeOrder::default(), NodeOrder::UNASSIGNED);
        assert!(NodeOrder(1).is_assigned());
    }

    #[test]
    fn test_order_sorts_numerically() {
        let mut orders = vec![NodeOrder(10), NodeOrder(2), NodeOrder(1)];
        orders.sort();
        assert_eq!(orders, vec![NodeOrder(1), NodeOrder(2), NodeOrder(10)]);
    }

    #[test]
    fn test_product_version_parse() {
        assert_eq!(
            "2.4.1".parse::<ProductVersion>().unwrap(),
            ProductVersion::new(2, 4, 1)
        );
        assert_eq!(
            "1.0.0-SNAPSHOT".parse::<ProductVersion>().unwrap(),
            ProductVersion::new(1, 0, 0)
        );
        assert!("1.x.0".parse::<ProductVersion>().is_err());
        assert!("1.0".parse::<ProductVersion>().is_err());
    }

    #[test]
    fn test_product_version_display_round_trip() {
        let version = ProductVersion::new(3, 2, 10);
        assert_eq!(version.to_string().parse::<ProductVersion>().unwrap(), version);
    }

    #[test]
    fn test_current_version_matches_crate() {
        assert_eq!(
            ProductVersion::current().to_string(),
            env!("CARGO_PKG_VERSION")
        );
    }
}
