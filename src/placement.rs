//! Placement selector
//!
//! Chooses the node with the lowest load ratio among active candidates.
//! Ratios are compared exactly by cross-multiplying, and ties go to the
//! lowest node id.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::models::Node;

/// Tunable placement behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlacementPolicy {
    /// Consider nodes at or above capacity (administrator bypass)
    pub allow_over_capacity: bool,
}

impl PlacementPolicy {
    pub fn strict() -> Self {
        Self {
            allow_over_capacity: false,
        }
    }

    pub fn over_capacity() -> Self {
        Self {
            allow_over_capacity: true,
        }
    }
}

/// Compare `a.load / a.cap` with `b.load / b.cap`. Zero capacity sorts last.
fn compare_load_ratio(a: &Node, b: &Node) -> Ordering {
    match (a.max_capacity == 0, b.max_capacity == 0) {
        (true, true) => a.current_load.cmp(&b.current_load),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let lhs = u64::from(a.current_load) * u64::from(b.max_capacity);
            let rhs = u64::from(b.current_load) * u64::from(a.max_capacity);
            lhs.cmp(&rhs)
        }
    }
}

/// Pick the best node for a new credential
pub fn select_node<'a>(candidates: &'a [Node], policy: &PlacementPolicy) -> Result<&'a Node> {
    candidates
        .iter()
        .filter(|n| n.active)
        .filter(|n| policy.allow_over_capacity || n.has_capacity())
        .min_by(|a, b| compare_load_ratio(a, b).then_with(|| a.id.cmp(&b.id)))
        .ok_or(Error::NoCapacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeAuth, NodeId, Protocol};
    use proptest::prelude::*;

    fn node(id: i64, load: u32, cap: u32) -> Node {
        Node {
            id: NodeId(id),
            name: format!("n{id}"),
            endpoint: "http://127.0.0.1:1".to_string(),
            auth: NodeAuth {
                username: String::new(),
                password: String::new(),
            },
            location: None,
            public_host: "h".to_string(),
            public_port: 1,
            protocol: Protocol::Vless,
            active: true,
            reachable: true,
            max_capacity: cap,
            current_load: load,
            last_health_check: None,
        }
    }

    #[test]
    fn test_selects_lowest_ratio() {
        let nodes = vec![node(2, 5, 10), node(1, 1, 10)];
        let chosen = select_node(&nodes, &PlacementPolicy::strict()).unwrap();
        assert_eq!(chosen.id, NodeId(1));
    }

    #[test]
    fn test_ratio_not_absolute_load() {
        // 3/100 beats 1/10
        let nodes = vec![node(1, 1, 10), node(2, 3, 100)];
        let chosen = select_node(&nodes, &PlacementPolicy::strict()).unwrap();
        assert_eq!(chosen.id, NodeId(2));
    }

    #[test]
    fn test_tie_breaks_on_lowest_id() {
        let nodes = vec![node(5, 2, 10), node(3, 1, 5), node(4, 2, 10)];
        let chosen = select_node(&nodes, &PlacementPolicy::strict()).unwrap();
        assert_eq!(chosen.id, NodeId(3));
    }

    #[test]
    fn test_inactive_and_full_excluded() {
        let mut inactive = node(1, 0, 10);
        inactive.active = false;
        let nodes = vec![inactive, node(2, 10, 10), node(3, 9, 10)];
        let chosen = select_node(&nodes, &PlacementPolicy::strict()).unwrap();
        assert_eq!(chosen.id, NodeId(3));
    }

    #[test]
    fn test_no_capacity() {
        assert!(matches!(
            select_node(&[], &PlacementPolicy::strict()),
            Err(Error::NoCapacity)
        ));

        let full = vec![node(1, 10, 10), node(2, 0, 0)];
        assert!(matches!(
            select_node(&full, &PlacementPolicy::strict()),
            Err(Error::NoCapacity)
        ));
    }

    #[test]
    fn test_over_capacity_policy() {
        let full = vec![node(1, 12, 10), node(2, 11, 10)];
        let chosen = select_node(&full, &PlacementPolicy::over_capacity()).unwrap();
        assert_eq!(chosen.id, NodeId(2));
    }

    proptest! {
        #[test]
        fn prop_selected_node_has_minimal_ratio(
            specs in prop::collection::vec((0u32..50, 1u32..50, any::<bool>()), 1..12)
        ) {
            let nodes: Vec<Node> = specs
                .iter()
                .enumerate()
                .map(|(i, (load, cap, active))| {
                    let mut n = node(i as i64 + 1, *load, *cap);
                    n.active = *active;
                    n
                })
                .collect();

            match select_node(&nodes, &PlacementPolicy::strict()) {
                Ok(chosen) => {
                    prop_assert!(chosen.active && chosen.has_capacity());
                    for other in nodes.iter().filter(|n| n.active && n.has_capacity()) {
                        let lhs = u64::from(chosen.current_load) * u64::from(other.max_capacity);
                        let rhs = u64::from(other.current_load) * u64::from(chosen.max_capacity);
                        prop_assert!(lhs < rhs || (lhs == rhs && chosen.id <= other.id));
                    }
                }
                Err(Error::NoCapacity) => {
                    prop_assert!(nodes.iter().all(|n| !n.active || !n.has_capacity()));
                }
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
        }
    }
}
