//! Subnet table
//!
//! Subnets are owned by the network layer. The proxy reads their keys and
//! reads/writes the Node Identity state. Enumeration order is slot order and
//! wraps around, which the advertising rotation relies on.

use tokio::time::Instant;

use super::KEY_UNUSED;

/// Node Identity advertising state of a subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeIdentity {
    Stopped,
    /// Running since the given instant.
    Running(Instant),
}

/// Key Refresh procedure phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyRefreshPhase {
    #[default]
    Normal,
    /// New keys distributed, old keys still used for transmission.
    Phase1,
    /// New keys used for transmission.
    Phase2,
}

/// Key material derived from one network key.
#[derive(Clone, PartialEq, Eq)]
pub struct SubnetKeys {
    /// Network ID advertised in Network ID mode.
    pub net_id: [u8; 8],
    /// IdentityKey used to encrypt the Node Identity hash.
    pub identity: [u8; 16],
}

impl std::fmt::Debug for SubnetKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubnetKeys")
            .field("net_id", &hex::encode(self.net_id))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Subnet {
    pub net_idx: u16,
    pub node_id: NodeIdentity,
    pub kr_phase: KeyRefreshPhase,
    /// `[current, new]`; the new set is only meaningful during key refresh.
    pub keys: [SubnetKeys; 2],
}

impl Subnet {
    pub fn new(net_idx: u16, keys: SubnetKeys) -> Self {
        Self {
            net_idx,
            node_id: NodeIdentity::Stopped,
            kr_phase: KeyRefreshPhase::Normal,
            keys: [keys.clone(), keys],
        }
    }

    /// Keys used for transmission in the current key refresh phase.
    pub fn tx_keys(&self) -> &SubnetKeys {
        match self.kr_phase {
            KeyRefreshPhase::Phase2 => &self.keys[1],
            _ => &self.keys[0],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.net_idx != KEY_UNUSED
    }
}

/// Events the network layer reports for a subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetEvent {
    Added,
    Deleted,
    Updated,
    Swapped,
    Revoked,
}

/// Fixed-capacity subnet table.
#[derive(Debug, Clone)]
pub struct SubnetTable {
    slots: Vec<Option<Subnet>>,
}

impl SubnetTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    /// Store a subnet in the first free slot. Returns `false` if the table is
    /// full or the index is already present.
    pub fn add(&mut self, subnet: Subnet) -> bool {
        if !subnet.is_valid() || self.get(subnet.net_idx).is_some() {
            return false;
        }
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(subnet);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, net_idx: u16) -> Option<Subnet> {
        self.slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|sub| sub.net_idx == net_idx))
            .and_then(Option::take)
    }

    pub fn get(&self, net_idx: u16) -> Option<&Subnet> {
        self.iter().find(|sub| sub.net_idx == net_idx)
    }

    pub fn get_mut(&mut self, net_idx: u16) -> Option<&mut Subnet> {
        self.iter_mut().find(|sub| sub.net_idx == net_idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subnet> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subnet> {
        self.slots.iter_mut().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the subnet following `after` in enumeration order, wrapping
    /// around. `None` (or an index no longer in the table) starts from the
    /// first slot. A single subnet is its own successor.
    pub fn next(&self, after: Option<u16>) -> Option<u16> {
        let start = after
            .and_then(|idx| self.position(idx))
            .map_or(0, |pos| pos + 1);
        let n = self.slots.len();
        (0..n)
            .map(|i| (start + i) % n)
            .find_map(|pos| self.slots[pos].as_ref().map(|sub| sub.net_idx))
    }

    fn position(&self, net_idx: u16) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|sub| sub.net_idx == net_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(tag: u8) -> SubnetKeys {
        SubnetKeys {
            net_id: [tag; 8],
            identity: [tag; 16],
        }
    }

    #[test]
    fn test_next_wraps_in_slot_order() {
        let mut table = SubnetTable::new(4);
        table.add(Subnet::new(0x000, keys(1)));
        table.add(Subnet::new(0x123, keys(2)));
        table.add(Subnet::new(0x456, keys(3)));

        assert_eq!(table.next(None), Some(0x000));
        assert_eq!(table.next(Some(0x000)), Some(0x123));
        assert_eq!(table.next(Some(0x123)), Some(0x456));
        assert_eq!(table.next(Some(0x456)), Some(0x000));
    }

    #[test]
    fn test_next_skips_holes_and_stale_cursor() {
        let mut table = SubnetTable::new(3);
        table.add(Subnet::new(1, keys(1)));
        table.add(Subnet::new(2, keys(2)));
        table.add(Subnet::new(3, keys(3)));
        table.remove(2);

        assert_eq!(table.next(Some(1)), Some(3));
        // Deleted index restarts from the first slot.
        assert_eq!(table.next(Some(2)), Some(1));
    }

    #[test]
    fn test_single_subnet_is_its_own_successor() {
        let mut table = SubnetTable::new(2);
        table.add(Subnet::new(7, keys(7)));
        assert_eq!(table.next(Some(7)), Some(7));
    }

    #[test]
    fn test_empty_table() {
        let table = SubnetTable::new(2);
        assert_eq!(table.next(None), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_add_rejects_duplicates_and_overflow() {
        let mut table = SubnetTable::new(1);
        assert!(table.add(Subnet::new(1, keys(1))));
        assert!(!table.add(Subnet::new(1, keys(1))));
        assert!(!table.add(Subnet::new(2, keys(2))));
        assert!(!SubnetTable::new(1).add(Subnet::new(KEY_UNUSED, keys(0))));
    }

    #[test]
    fn test_tx_keys_follow_key_refresh() {
        let mut sub = Subnet::new(1, keys(1));
        sub.keys[1] = keys(2);

        sub.kr_phase = KeyRefreshPhase::Phase1;
        assert_eq!(sub.tx_keys().net_id, [1; 8]);

        sub.kr_phase = KeyRefreshPhase::Phase2;
        assert_eq!(sub.tx_keys().net_id, [2; 8]);
    }
}
