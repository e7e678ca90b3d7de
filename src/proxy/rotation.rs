//! Advertising rotation across subnets
//!
//! Each advertising cycle picks one subnet and a mode for it. With several
//! eligible subnets the Node Identity window is cut into slices so that no
//! subnet holds the radio for long; the cursor advances after every cycle.
//!
//! The cursor is a subnet index, not a reference: it is cleared when its
//! subnet is deleted and re-seeded from the table on the next cycle.

use std::time::Duration;

use tokio::time::Instant;

use crate::mesh::{NodeIdentity, Subnet, SubnetTable};

use super::ProxyError;

/// Fewest slices the Node Identity window is divided into.
const MIN_SLICES: u32 = 6;
/// Shortest slice, to avoid excessive rotation.
const MIN_SLICE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvMode {
    NodeIdentity,
    NetworkId,
}

/// What to advertise this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvPlan {
    pub net_idx: u16,
    pub mode: AdvMode,
    /// `None` advertises until stopped or connected.
    pub duration: Option<Duration>,
}

/// Whether a subnet takes part in proxy advertising.
pub fn is_eligible(subnet: &Subnet, gatt_proxy: bool) -> bool {
    subnet.is_valid() && (matches!(subnet.node_id, NodeIdentity::Running(_)) || gatt_proxy)
}

/// Per-subnet advertising budget for `eligible` subnets sharing the Node
/// Identity window. A single subnet gets no cap.
pub fn slice_budget(timeout: Duration, eligible: usize) -> Option<Duration> {
    if eligible <= 1 {
        return None;
    }
    let slices = u32::try_from(eligible).unwrap_or(u32::MAX).max(MIN_SLICES);
    Some((timeout / slices).max(MIN_SLICE))
}

#[derive(Debug, Clone, Default)]
pub struct AdvRotator {
    cursor: Option<u16>,
}

impl AdvRotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subnet to consider first on the next cycle.
    pub fn cursor(&self) -> Option<u16> {
        self.cursor
    }

    /// Advertise `net_idx` on the next cycle.
    pub fn prioritize(&mut self, net_idx: u16) {
        self.cursor = Some(net_idx);
    }

    pub fn on_subnet_deleted(&mut self, net_idx: u16) {
        if self.cursor == Some(net_idx) {
            self.cursor = None;
        }
    }

    /// Plan one advertising cycle.
    ///
    /// Expired Node Identity on the chosen subnet is stopped here, in which
    /// case the subnet falls back to Network ID.
    pub fn plan(
        &mut self,
        subnets: &mut SubnetTable,
        gatt_proxy: bool,
        timeout: Duration,
        now: Instant,
    ) -> Result<AdvPlan, ProxyError> {
        let net_idx = self.select(subnets, gatt_proxy)?;

        let eligible = subnets
            .iter()
            .filter(|sub| is_eligible(sub, gatt_proxy))
            .count();
        let budget = slice_budget(timeout, eligible);
        log::debug!("{} eligible subnets, budget {:?}", eligible, budget);

        let sub = subnets
            .get_mut(net_idx)
            .ok_or(ProxyError::NoSubnets)?;

        let mut plan = AdvPlan {
            net_idx,
            mode: AdvMode::NetworkId,
            duration: budget,
        };

        if let NodeIdentity::Running(start) = sub.node_id {
            let active = now.saturating_duration_since(start);
            if active < timeout {
                let remaining = timeout - active;
                log::debug!(
                    "Node ID active for {:?}, {:?} remaining",
                    active,
                    remaining
                );
                plan.mode = AdvMode::NodeIdentity;
                plan.duration = Some(budget.map_or(remaining, |b| b.min(remaining)));
            } else {
                sub.node_id = NodeIdentity::Stopped;
                log::debug!("Node ID stopped for net_idx 0x{:04x}", net_idx);
            }
        }

        self.cursor = subnets.next(Some(net_idx));

        log::debug!(
            "Advertising {:?} for {:?} on net_idx 0x{:04x}",
            plan.mode,
            plan.duration,
            net_idx
        );
        Ok(plan)
    }

    /// First eligible subnet at or after the cursor, wrapping once.
    fn select(&self, subnets: &SubnetTable, gatt_proxy: bool) -> Result<u16, ProxyError> {
        let start = self
            .cursor
            .filter(|idx| subnets.get(*idx).is_some())
            .or_else(|| subnets.next(None))
            .ok_or(ProxyError::NoSubnets)?;

        let mut idx = start;
        loop {
            if subnets.get(idx).is_some_and(|sub| is_eligible(sub, gatt_proxy)) {
                return Ok(idx);
            }
            idx = match subnets.next(Some(idx)) {
                Some(next) if next != start => next,
                _ => return Err(ProxyError::NoSubnets),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::SubnetKeys;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn table(indices: &[u16]) -> SubnetTable {
        let mut subnets = SubnetTable::new(8);
        for &idx in indices {
            let keys = SubnetKeys {
                net_id: [idx as u8; 8],
                identity: [idx as u8; 16],
            };
            assert!(subnets.add(Subnet::new(idx, keys)));
        }
        subnets
    }

    #[test]
    fn test_slice_budget() {
        assert_eq!(slice_budget(TIMEOUT, 0), None);
        assert_eq!(slice_budget(TIMEOUT, 1), None);
        assert_eq!(slice_budget(TIMEOUT, 3), Some(Duration::from_secs(10)));
        assert_eq!(slice_budget(TIMEOUT, 6), Some(Duration::from_secs(10)));
        assert_eq!(slice_budget(TIMEOUT, 12), Some(Duration::from_secs(5)));
        assert_eq!(
            slice_budget(Duration::from_secs(3), 2),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_round_robin_network_id() {
        let mut subnets = table(&[0, 1, 2]);
        let mut rotator = AdvRotator::new();
        let now = Instant::now();

        let order: Vec<u16> = (0..4)
            .map(|_| rotator.plan(&mut subnets, true, TIMEOUT, now).unwrap())
            .map(|plan| {
                assert_eq!(plan.mode, AdvMode::NetworkId);
                assert_eq!(plan.duration, Some(Duration::from_secs(10)));
                plan.net_idx
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_single_subnet_is_uncapped() {
        let mut subnets = table(&[5]);
        let mut rotator = AdvRotator::new();

        let plan = rotator
            .plan(&mut subnets, true, TIMEOUT, Instant::now())
            .unwrap();
        assert_eq!(plan.net_idx, 5);
        assert_eq!(plan.duration, None);
        assert_eq!(rotator.cursor(), Some(5));
    }

    #[test]
    fn test_node_identity_remaining_time() {
        let mut subnets = table(&[0]);
        let start = Instant::now();
        subnets.get_mut(0).unwrap().node_id = NodeIdentity::Running(start);
        let mut rotator = AdvRotator::new();

        let plan = rotator
            .plan(&mut subnets, false, TIMEOUT, start + Duration::from_secs(45))
            .unwrap();
        assert_eq!(plan.mode, AdvMode::NodeIdentity);
        assert_eq!(plan.duration, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_node_identity_capped_by_budget() {
        let mut subnets = table(&[0, 1, 2]);
        let start = Instant::now();
        subnets.get_mut(0).unwrap().node_id = NodeIdentity::Running(start);
        let mut rotator = AdvRotator::new();

        let plan = rotator.plan(&mut subnets, true, TIMEOUT, start).unwrap();
        assert_eq!(plan.mode, AdvMode::NodeIdentity);
        assert_eq!(plan.duration, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_expired_identity_falls_back_to_network_id() {
        let mut subnets = table(&[0]);
        let start = Instant::now();
        subnets.get_mut(0).unwrap().node_id = NodeIdentity::Running(start);
        let mut rotator = AdvRotator::new();

        let plan = rotator
            .plan(&mut subnets, true, TIMEOUT, start + TIMEOUT)
            .unwrap();
        assert_eq!(plan.mode, AdvMode::NetworkId);
        assert_eq!(subnets.get(0).unwrap().node_id, NodeIdentity::Stopped);
    }

    #[test]
    fn test_skips_ineligible_subnets() {
        let mut subnets = table(&[0, 1, 2]);
        let now = Instant::now();
        subnets.get_mut(1).unwrap().node_id = NodeIdentity::Running(now);
        let mut rotator = AdvRotator::new();

        // GATT proxy off: only the subnet running Node Identity qualifies.
        let plan = rotator.plan(&mut subnets, false, TIMEOUT, now).unwrap();
        assert_eq!(plan.net_idx, 1);
        assert_eq!(plan.duration, Some(TIMEOUT));
        assert_eq!(rotator.cursor(), Some(2));

        let plan = rotator.plan(&mut subnets, false, TIMEOUT, now).unwrap();
        assert_eq!(plan.net_idx, 1);
    }

    #[test]
    fn test_no_subnets() {
        let mut rotator = AdvRotator::new();
        let now = Instant::now();

        let mut empty = SubnetTable::new(2);
        assert!(matches!(
            rotator.plan(&mut empty, true, TIMEOUT, now),
            Err(ProxyError::NoSubnets)
        ));

        let mut idle = table(&[0, 1]);
        assert!(matches!(
            rotator.plan(&mut idle, false, TIMEOUT, now),
            Err(ProxyError::NoSubnets)
        ));
    }

    #[test]
    fn test_deleted_cursor_is_cleared() {
        let mut subnets = table(&[0, 1, 2]);
        let mut rotator = AdvRotator::new();
        let now = Instant::now();

        rotator.plan(&mut subnets, true, TIMEOUT, now).unwrap();
        assert_eq!(rotator.cursor(), Some(1));

        subnets.remove(1);
        rotator.on_subnet_deleted(1);
        assert_eq!(rotator.cursor(), None);

        let plan = rotator.plan(&mut subnets, true, TIMEOUT, now).unwrap();
        assert_eq!(plan.net_idx, 0);
    }

    #[test]
    fn test_prioritize() {
        let mut subnets = table(&[0, 1, 2]);
        let mut rotator = AdvRotator::new();
        rotator.prioritize(2);

        let plan = rotator
            .plan(&mut subnets, true, TIMEOUT, Instant::now())
            .unwrap();
        assert_eq!(plan.net_idx, 2);
        assert_eq!(rotator.cursor(), Some(0));
    }
}
