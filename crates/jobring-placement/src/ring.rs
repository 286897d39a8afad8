//! Consistent hashing ring implementation.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::hasher::RingHasher;

/// A key whose owner differs between two ring snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassignment {
    /// The job name that moved.
    pub key: String,
    /// Owner in the old ring (`None` if the old ring was empty).
    pub from: Option<String>,
    /// Owner in the new ring (`None` if the new ring is empty).
    pub to: Option<String>,
}

/// Consistent hashing ring for deterministic job placement.
///
/// Each member is mapped to `replicas` virtual nodes on a u64 ring. A key is
/// owned by the first vnode at or after the key's position, wrapping around
/// to the lowest position when none is found.
///
/// A ring is built once and then only read: membership changes produce a new
/// ring rather than mutating a shared one, so lookups against a snapshot need
/// no locking.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Virtual node positions: ring position -> member.
    vnodes: BTreeMap<u64, String>,
    /// Members that have been added.
    members: BTreeSet<String>,
    /// Number of vnodes per member.
    replicas: usize,
    hasher: RingHasher,
}

impl HashRing {
    /// Create a new empty ring.
    ///
    /// `hasher` of `None` selects [`RingHasher::default`]. A replica count of
    /// zero is treated as one so that every added member owns some keys.
    pub fn new(replicas: usize, hasher: Option<RingHasher>) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            members: BTreeSet::new(),
            replicas: replicas.max(1),
            hasher: hasher.unwrap_or_default(),
        }
    }

    /// Build a complete ring from a member list.
    pub fn build<I, S>(replicas: usize, hasher: Option<RingHasher>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = Self::new(replicas, hasher);
        for member in members {
            ring.add(member.as_ref());
        }
        ring
    }

    /// Add a member to the ring.
    ///
    /// Returns `false` without touching the ring if `member` is empty or
    /// already present.
    pub fn add(&mut self, member: &str) -> bool {
        if member.is_empty() {
            warn!("refusing to add empty member to ring");
            return false;
        }
        if !self.members.insert(member.to_string()) {
            debug!(member, "member already on ring");
            return false;
        }

        for i in 0..self.replicas {
            let pos = self.vnode_position(member, i);
            self.vnodes.insert(pos, member.to_string());
        }

        debug!(member, replicas = self.replicas, "added member to ring");
        true
    }

    /// Return the member that owns `key`, or `None` if the ring is empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        let pos = self.hasher.hash(key.as_bytes());

        // Everything >= pos, then wrap around to the start.
        self.vnodes
            .range(pos..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .map(|(_, member)| member.as_str())
    }

    /// Whether the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.vnodes.is_empty()
    }

    /// Return the number of members on the ring.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Return the total number of vnodes on the ring.
    pub fn vnode_count(&self) -> usize {
        self.vnodes.len()
    }

    /// Return the vnodes-per-member count.
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Whether `member` has been added.
    pub fn contains(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    /// Return all members, sorted.
    pub fn members(&self) -> Vec<String> {
        self.members.iter().cloned().collect()
    }

    /// Compute which keys change owner between two ring snapshots.
    pub fn diff<I, S>(old: &HashRing, new: &HashRing, keys: I) -> Vec<Reassignment>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter()
            .filter_map(|key| {
                let key = key.as_ref();
                let from = old.get(key);
                let to = new.get(key);
                (from != to).then(|| Reassignment {
                    key: key.to_string(),
                    from: from.map(str::to_string),
                    to: to.map(str::to_string),
                })
            })
            .collect()
    }

    /// Compute a vnode's position: hash(decimal(replica_index) ++ member).
    fn vnode_position(&self, member: &str, replica_index: usize) -> u64 {
        let mut input = replica_index.to_string().into_bytes();
        input.extend_from_slice(member.as_bytes());
        self.hasher.hash(&input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("node-{i}")).collect()
    }

    fn jobs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("job-{i}")).collect()
    }

    fn owners(ring: &HashRing, keys: &[String]) -> Vec<String> {
        keys.iter()
            .map(|k| ring.get(k).expect("non-empty ring").to_string())
            .collect()
    }

    #[test]
    fn test_empty_ring_returns_none() {
        let ring = HashRing::new(3, None);
        assert!(ring.is_empty());
        assert_eq!(ring.get("job1"), None);
    }

    #[test]
    fn test_single_member_owns_everything() {
        let ring = HashRing::build(8, None, ["solo"]);
        for key in jobs(100) {
            assert_eq!(ring.get(&key), Some("solo"));
        }
    }

    #[test]
    fn test_get_is_deterministic_for_three_nodes() {
        let ring = HashRing::build(3, None, ["nodeA", "nodeB", "nodeC"]);
        let owner = ring.get("job1").expect("owner").to_string();
        assert!(["nodeA", "nodeB", "nodeC"].contains(&owner.as_str()));

        for _ in 0..100 {
            assert_eq!(ring.get("job1"), Some(owner.as_str()));
        }

        // An independently built ring agrees.
        let other = HashRing::build(3, None, ["nodeA", "nodeB", "nodeC"]);
        assert_eq!(other.get("job1"), Some(owner.as_str()));
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let a = HashRing::build(16, None, ["nodeA", "nodeB", "nodeC"]);
        let b = HashRing::build(16, None, ["nodeC", "nodeA", "nodeB"]);
        for key in jobs(500) {
            assert_eq!(a.get(&key), b.get(&key), "placement differs for {key}");
        }
    }

    #[test]
    fn test_add_is_idempotent_and_rejects_empty() {
        let mut ring = HashRing::new(4, None);
        assert!(ring.add("nodeA"));
        assert!(!ring.add("nodeA"));
        assert!(!ring.add(""));

        assert_eq!(ring.member_count(), 1);
        assert_eq!(ring.vnode_count(), 4);
        assert!(ring.contains("nodeA"));
        assert!(!ring.contains(""));
    }

    #[test]
    fn test_zero_replicas_clamped_to_one() {
        let ring = HashRing::build(0, None, ["nodeA"]);
        assert_eq!(ring.replicas(), 1);
        assert_eq!(ring.get("anything"), Some("nodeA"));
    }

    #[test]
    fn test_wraps_around_past_highest_vnode() {
        let hasher = RingHasher::new(|data| match data {
            b"0low" => 10,
            b"0high" => 20,
            b"early" => 5,
            b"middle" => 15,
            _ => 1_000,
        });
        let ring = HashRing::build(1, Some(hasher), ["low", "high"]);

        assert_eq!(ring.get("early"), Some("low"));
        assert_eq!(ring.get("middle"), Some("high"));
        // Past every vnode: wraps to the lowest position.
        assert_eq!(ring.get("late"), Some("low"));
    }

    #[test]
    fn test_members_roughly_balanced() {
        let ring = HashRing::build(128, None, members(3));
        let keys = jobs(10_000);

        for member in ring.members() {
            let count = keys
                .iter()
                .filter(|k| ring.get(k) == Some(member.as_str()))
                .count();
            let share = count as f64 / keys.len() as f64;
            assert!(
                (0.2..=0.5).contains(&share),
                "distribution too skewed: {member} owns {share:.2}"
            );
        }
    }

    #[test]
    fn test_adding_node_only_moves_keys_to_it() {
        let old = HashRing::build(3, None, ["nodeA", "nodeB", "nodeC"]);
        let new = HashRing::build(3, None, ["nodeA", "nodeB", "nodeC", "nodeD"]);
        let keys = jobs(2_000);

        let moved = HashRing::diff(&old, &new, &keys);
        for r in &moved {
            assert_eq!(r.to.as_deref(), Some("nodeD"), "{} moved elsewhere", r.key);
        }

        // Most jobs keep their owner.
        assert!(
            moved.len() < keys.len() / 2,
            "too many jobs moved: {}/{}",
            moved.len(),
            keys.len()
        );
    }

    #[test]
    fn test_removing_node_remaps_about_one_nth() {
        let all = members(5);
        let old = HashRing::build(100, None, &all);
        let new = HashRing::build(100, None, &all[1..]);
        let keys = jobs(10_000);

        let before = owners(&old, &keys);
        let after = owners(&new, &keys);

        let mut moved = 0usize;
        for (i, (b, a)) in before.iter().zip(after.iter()).enumerate() {
            if b != a {
                moved += 1;
                assert_eq!(b, &all[0], "key {i} was not on the removed node but moved");
            }
        }

        // ~1/5 should move.
        let ratio = moved as f64 / keys.len() as f64;
        assert!(
            (0.1..=0.3).contains(&ratio),
            "unexpected remap ratio: {moved}/{} ({ratio:.2})",
            keys.len()
        );
    }

    #[test]
    fn test_diff_of_identical_rings_is_empty() {
        let a = HashRing::build(10, None, members(4));
        let b = HashRing::build(10, None, members(4));
        assert!(HashRing::diff(&a, &b, jobs(1_000)).is_empty());
    }

    #[test]
    fn test_diff_against_empty_ring() {
        let empty = HashRing::new(10, None);
        let full = HashRing::build(10, None, ["nodeA"]);

        let moved = HashRing::diff(&empty, &full, ["job1"]);
        assert_eq!(
            moved,
            vec![Reassignment {
                key: "job1".to_string(),
                from: None,
                to: Some("nodeA".to_string()),
            }]
        );
    }
}
