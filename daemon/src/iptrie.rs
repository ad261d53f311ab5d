//! Longest-prefix-match index over IPv4 and IPv6 indicators.
//!
//! A path-compressed binary trie with one root per address family. Bits are
//! examined MSB-first; each node carries the masked prefix up to its position
//! and `skip_bits`, the number of address bits it represents. Only leaves are
//! positive matches, so `contains` has longest-prefix semantics: compression
//! preserves every strictly shorter matching prefix along the descent path.
//!
//! Nodes live in an arena indexed by `u32` (parent links never form cycles
//! and removal reuses slots through a free list). The trie itself is plain
//! data; the aggregator publishes immutable `Arc` snapshots for readers.

use std::net::IpAddr;

use ipnet::IpNet;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrieError {
    #[error("invalid IP or CIDR: {0}")]
    InvalidAddress(String),

    #[error("network already exists: {0}")]
    AlreadyExists(String),
}

const NIL: u32 = u32::MAX;
const ROOT: u32 = 0;

/// A masked network prefix. For IPv4 the address occupies the low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Network {
    addr: u128,
    prefix_len: u32,
}

#[derive(Debug, Clone)]
struct Node {
    children: [u32; 2],
    parent: u32,
    skip_bits: u32,
    network: Network,
    is_leaf: bool,
}

struct PrefixTree {
    nodes: Vec<Node>,
    free: Vec<u32>,
    total_bits: u32,
    len: usize,
}

impl PrefixTree {
    fn new(total_bits: u32) -> PrefixTree {
        PrefixTree {
            nodes: vec![Node {
                children: [NIL, NIL],
                parent: NIL,
                skip_bits: 0,
                network: Network { addr: 0, prefix_len: 0 },
                is_leaf: false,
            }],
            free: Vec::new(),
            total_bits,
            len: 0,
        }
    }

    fn value_mask(&self) -> u128 {
        if self.total_bits == 128 {
            u128::MAX
        } else {
            (1u128 << self.total_bits) - 1
        }
    }

    fn prefix_mask(&self, prefix_len: u32) -> u128 {
        if prefix_len == 0 {
            0
        } else {
            (u128::MAX << (self.total_bits - prefix_len)) & self.value_mask()
        }
    }

    fn masked(&self, addr: u128, prefix_len: u32) -> u128 {
        addr & self.prefix_mask(prefix_len)
    }

    fn net_contains(&self, network: Network, addr: u128) -> bool {
        self.masked(addr, network.prefix_len) == network.addr
    }

    fn bit(addr: u128, pos: u32) -> usize {
        ((addr >> pos) & 1) as usize
    }

    /// The bit a node tests to select a child; negative once the node
    /// represents a full-length address.
    fn target_bit_pos(&self, idx: u32) -> i32 {
        self.total_bits as i32 - self.nodes[idx as usize].skip_bits as i32 - 1
    }

    /// Lowest bit position below which the two networks may diverge; all
    /// bits at positions >= the returned value are common to both.
    fn least_common_bit_pos(&self, a: Network, b: Network) -> u32 {
        let min_prefix = a.prefix_len.min(b.prefix_len);
        let mask_pos = self.total_bits - min_prefix;
        let diff = a.addr ^ b.addr;
        let addr_lcb = if diff == 0 { 0 } else { 128 - diff.leading_zeros() };
        mask_pos.max(addr_lcb)
    }

    fn alloc(&mut self, node: Node) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = node;
            idx
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        }
    }

    fn release(&mut self, idx: u32) {
        self.nodes[idx as usize].is_leaf = false;
        self.nodes[idx as usize].children = [NIL, NIL];
        self.nodes[idx as usize].parent = NIL;
        self.free.push(idx);
    }

    fn child_count(&self, idx: u32) -> usize {
        self.nodes[idx as usize]
            .children
            .iter()
            .filter(|&&c| c != NIL)
            .count()
    }

    fn lone_child(&self, idx: u32) -> Option<u32> {
        self.nodes[idx as usize]
            .children
            .iter()
            .copied()
            .find(|&c| c != NIL)
    }

    /// Returns true when the network was newly inserted, false on duplicate.
    fn insert(&mut self, network: Network) -> bool {
        let mut current = ROOT;
        loop {
            if self.nodes[current as usize].network == network {
                if self.nodes[current as usize].is_leaf {
                    return false;
                }
                self.nodes[current as usize].is_leaf = true;
                self.len += 1;
                return true;
            }

            let tpos = self.target_bit_pos(current);
            debug_assert!(tpos >= 0, "descended past a full-length prefix");
            let bit = Self::bit(network.addr, tpos as u32);

            let child = self.nodes[current as usize].children[bit];
            if child == NIL {
                let leaf = self.alloc(Node {
                    children: [NIL, NIL],
                    parent: current,
                    skip_bits: network.prefix_len,
                    network,
                    is_leaf: true,
                });
                self.nodes[current as usize].children[bit] = leaf;
                self.len += 1;
                return true;
            }

            let child_network = self.nodes[child as usize].network;
            let lcb = self.least_common_bit_pos(network, child_network);
            let diverging_pos = lcb as i32 - 1;
            if diverging_pos <= self.target_bit_pos(child) {
                current = child;
                continue;
            }

            // Split the edge: a path node carrying the shared prefix adopts
            // the existing child, and the descent continues below it.
            let skip = self.total_bits - lcb;
            let path = self.alloc(Node {
                children: [NIL, NIL],
                parent: current,
                skip_bits: skip,
                network: Network {
                    addr: self.masked(network.addr, skip),
                    prefix_len: skip,
                },
                is_leaf: false,
            });
            self.nodes[current as usize].children[bit] = path;
            let path_bit = Self::bit(child_network.addr, self.target_bit_pos(path) as u32);
            self.nodes[path as usize].children[path_bit] = child;
            self.nodes[child as usize].parent = path;
            current = path;
        }
    }

    fn contains(&self, addr: u128) -> bool {
        let mut current = ROOT;
        loop {
            let node = &self.nodes[current as usize];
            if !self.net_contains(node.network, addr) {
                return false;
            }
            if node.is_leaf {
                return true;
            }
            let tpos = self.target_bit_pos(current);
            if tpos < 0 {
                return false;
            }
            let child = node.children[Self::bit(addr, tpos as u32)];
            if child == NIL {
                return false;
            }
            current = child;
        }
    }

    /// Returns true when a leaf was removed; absent networks are a no-op.
    fn remove(&mut self, network: Network) -> bool {
        let mut current = ROOT;
        loop {
            let node = &self.nodes[current as usize];
            if node.is_leaf && node.network == network {
                self.nodes[current as usize].is_leaf = false;
                self.len -= 1;
                self.compress_path(current);
                return true;
            }
            let tpos = self.target_bit_pos(current);
            if tpos < 0 {
                return false;
            }
            let child = node.children[Self::bit(network.addr, tpos as u32)];
            if child == NIL {
                return false;
            }
            current = child;
        }
    }

    fn can_compress(&self, idx: u32) -> bool {
        let node = &self.nodes[idx as usize];
        !node.is_leaf && node.parent != NIL && self.child_count(idx) <= 1
    }

    /// Restore the invariant that every non-root path node has two children:
    /// splice lone children past compressible ancestors and detach empties.
    fn compress_path(&mut self, idx: u32) {
        if !self.can_compress(idx) {
            return;
        }

        let parent = self.nodes[idx as usize].parent;
        match self.lone_child(idx) {
            None => {
                for slot in 0..2 {
                    if self.nodes[parent as usize].children[slot] == idx {
                        self.nodes[parent as usize].children[slot] = NIL;
                    }
                }
                self.release(idx);
                self.compress_path(parent);
            }
            Some(lone) => {
                // climb to the first ancestor that keeps two children
                let mut anchor = parent;
                while self.can_compress(anchor) {
                    anchor = self.nodes[anchor as usize].parent;
                }
                let anchor_bit = Self::bit(
                    self.nodes[idx as usize].network.addr,
                    self.target_bit_pos(anchor) as u32,
                );
                let chain_top = self.nodes[anchor as usize].children[anchor_bit];
                self.nodes[anchor as usize].children[anchor_bit] = lone;
                self.nodes[lone as usize].parent = anchor;

                // free the bypassed single-child chain, chain_top down to idx
                let mut node = chain_top;
                loop {
                    let next = self.lone_child(node);
                    let done = node == idx;
                    self.release(node);
                    if done {
                        break;
                    }
                    node = next.expect("bypassed chain node has one child");
                }
                self.compress_path(anchor);
            }
        }
    }
}

// =============================================================================
// Public trie over both address families
// =============================================================================

pub struct IpTrie {
    v4: PrefixTree,
    v6: PrefixTree,
}

impl IpTrie {
    pub fn new() -> IpTrie {
        IpTrie {
            v4: PrefixTree::new(32),
            v6: PrefixTree::new(128),
        }
    }

    /// Insert an address or CIDR. Host bits of a CIDR are masked away.
    pub fn insert(&mut self, addr: &str) -> Result<(), TrieError> {
        let (network, is_v6) = parse_network(addr)
            .ok_or_else(|| TrieError::InvalidAddress(addr.trim().to_string()))?;
        let tree = if is_v6 { &mut self.v6 } else { &mut self.v4 };
        if tree.insert(network) {
            Ok(())
        } else {
            Err(TrieError::AlreadyExists(addr.trim().to_string()))
        }
    }

    /// Longest-prefix containment check; false for unparseable input.
    pub fn contains(&self, addr: &str) -> bool {
        match parse_network(addr) {
            Some((network, true)) => self.v6.contains(network.addr),
            Some((network, false)) => self.v4.contains(network.addr),
            None => false,
        }
    }

    /// Remove a previously inserted network. Removing an absent network is
    /// a silent no-op; only unparseable input is an error.
    pub fn remove(&mut self, addr: &str) -> Result<(), TrieError> {
        let (network, is_v6) = parse_network(addr)
            .ok_or_else(|| TrieError::InvalidAddress(addr.trim().to_string()))?;
        let tree = if is_v6 { &mut self.v6 } else { &mut self.v4 };
        tree.remove(network);
        Ok(())
    }

    /// Number of stored networks (leaves) across both families.
    pub fn len(&self) -> usize {
        self.v4.len + self.v6.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IpTrie {
    fn default() -> IpTrie {
        IpTrie::new()
    }
}

fn parse_network(addr: &str) -> Option<(Network, bool)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return None;
    }
    if addr.contains('/') {
        return match addr.parse::<IpNet>().ok()? {
            IpNet::V4(net) => {
                let net = net.trunc();
                Some((
                    Network {
                        addr: u32::from(net.network()) as u128,
                        prefix_len: u32::from(net.prefix_len()),
                    },
                    false,
                ))
            }
            IpNet::V6(net) => {
                let net = net.trunc();
                Some((
                    Network {
                        addr: u128::from(net.network()),
                        prefix_len: u32::from(net.prefix_len()),
                    },
                    true,
                ))
            }
        };
    }
    match addr.parse::<IpAddr>().ok()? {
        IpAddr::V4(ip) => Some((
            Network {
                addr: u32::from(ip) as u128,
                prefix_len: 32,
            },
            false,
        )),
        IpAddr::V6(ip) => Some((
            Network {
                addr: u128::from(ip),
                prefix_len: 128,
            },
            true,
        )),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    impl PrefixTree {
        /// Walk from the root checking structural invariants: parent links,
        /// the two-children rule for path nodes, and the leaf count.
        fn check_invariants(&self) {
            let mut stack = vec![ROOT];
            let mut leaves = 0;
            while let Some(idx) = stack.pop() {
                let node = &self.nodes[idx as usize];
                if node.is_leaf {
                    leaves += 1;
                }
                if idx != ROOT && !node.is_leaf {
                    assert!(
                        self.child_count(idx) >= 2,
                        "path node {idx} has fewer than 2 children"
                    );
                }
                for &child in &node.children {
                    if child != NIL {
                        assert_eq!(self.nodes[child as usize].parent, idx);
                        stack.push(child);
                    }
                }
            }
            assert_eq!(leaves, self.len, "leaf count does not match size");
        }
    }

    impl IpTrie {
        fn check_invariants(&self) {
            self.v4.check_invariants();
            self.v6.check_invariants();
        }
    }

    #[test]
    fn test_insert_valid() {
        let cases: &[&[&str]] = &[
            &["192.168.1.1", "10.0.0.0/8", "172.16.0.0/12"],
            &["2001:db8::/32", "::1", "fe80::/10"],
            &["192.168.1.1", "2001:db8::/32", "10.0.0.0/8", "fe80::/10"],
            &["0.0.0.0", "255.255.255.255", "127.0.0.1"],
            &["::", "::1", "fe80::1", "ff02::1"],
        ];
        for inputs in cases {
            let mut trie = IpTrie::new();
            for input in *inputs {
                trie.insert(input).expect(input);
            }
            assert_eq!(trie.len(), inputs.len());
            trie.check_invariants();
        }
    }

    #[test]
    fn test_insert_invalid() {
        let mut trie = IpTrie::new();
        for input in ["invalid", "256.256.256.256", "2001:xyz::/32", ""] {
            assert!(
                matches!(trie.insert(input), Err(TrieError::InvalidAddress(_))),
                "{input:?}"
            );
        }
        assert_eq!(trie.len(), 0);
    }

    #[test]
    fn test_insert_duplicate() {
        let mut trie = IpTrie::new();
        trie.insert("192.168.1.1").unwrap();
        assert!(matches!(
            trie.insert("192.168.1.1"),
            Err(TrieError::AlreadyExists(_))
        ));
        // a /32 is the same network as the bare address
        assert!(matches!(
            trie.insert("192.168.1.1/32"),
            Err(TrieError::AlreadyExists(_))
        ));
        trie.insert("192.168.1.2").unwrap();
        assert_eq!(trie.len(), 2);
    }

    #[test]
    fn test_contains() {
        let cases: &[(&[&str], &[(&str, bool)])] = &[
            (
                &["192.168.1.1", "10.0.0.1"],
                &[("192.168.1.1", true), ("192.168.1.2", false), ("10.0.0.1", true)],
            ),
            (
                &["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"],
                &[
                    ("10.1.1.1", true),
                    ("172.16.1.1", true),
                    ("192.168.1.1", true),
                    ("8.8.8.8", false),
                ],
            ),
            (
                &["2001:db8::1", "fe80::1"],
                &[("2001:db8::1", true), ("2001:db8::2", false), ("fe80::1", true)],
            ),
            (
                &["2001:db8::/32", "fe80::/10"],
                &[
                    ("2001:db8::1", true),
                    ("2001:db8:1::1", true),
                    ("fe80::1", true),
                    ("2001:db9::1", false),
                ],
            ),
            (
                &["127.0.0.0/8", "::1/128", "169.254.0.0/16", "fe80::/10"],
                &[
                    ("127.0.0.1", true),
                    ("::1", true),
                    ("169.254.1.1", true),
                    ("fe80::1", true),
                ],
            ),
        ];
        for (inserts, queries) in cases {
            let mut trie = IpTrie::new();
            for insert in *inserts {
                trie.insert(insert).expect(insert);
            }
            for (query, expected) in *queries {
                assert_eq!(trie.contains(query), *expected, "contains({query})");
            }
        }
    }

    #[test]
    fn test_lpm_mixed_families() {
        // coverage by CIDR and exact entries together
        let mut trie = IpTrie::new();
        trie.insert("10.0.0.0/8").unwrap();
        trie.insert("192.168.1.1").unwrap();
        assert!(trie.contains("10.1.2.3"));
        assert!(trie.contains("192.168.1.1"));
        assert!(!trie.contains("8.8.8.8"));

        trie.insert("2001:db8::/32").unwrap();
        assert!(trie.contains("2001:db8:dead::1"));
        assert!(!trie.contains("2001:db9::1"));
    }

    #[test]
    fn test_remove() {
        let mut trie = IpTrie::new();
        for insert in ["192.168.1.1", "10.0.0.0/8", "172.16.0.0/12"] {
            trie.insert(insert).unwrap();
        }
        trie.remove("192.168.1.1").unwrap();
        trie.remove("10.0.0.0/8").unwrap();
        assert!(!trie.contains("192.168.1.1"));
        assert!(!trie.contains("10.1.1.1"));
        assert!(trie.contains("172.16.1.1"));
        assert_eq!(trie.len(), 1);
        trie.check_invariants();
    }

    #[test]
    fn test_remove_ipv6() {
        let mut trie = IpTrie::new();
        for insert in ["2001:db8::1", "2001:db8::/32", "fe80::/10"] {
            trie.insert(insert).unwrap();
        }
        trie.remove("2001:db8::1").unwrap();
        trie.remove("2001:db8::/32").unwrap();
        assert!(!trie.contains("2001:db8::1"));
        assert!(!trie.contains("2001:db8:1::1"));
        assert!(trie.contains("fe80::1"));
        trie.check_invariants();
    }

    #[test]
    fn test_remove_invalid() {
        let mut trie = IpTrie::new();
        trie.insert("192.168.1.1").unwrap();
        assert!(trie.remove("invalid").is_err());
        assert!(trie.remove("256.256.256.256").is_err());
        assert!(trie.contains("192.168.1.1"));
    }

    #[test]
    fn test_remove_nonexistent_is_noop() {
        let mut trie = IpTrie::new();
        trie.insert("192.168.1.1").unwrap();
        trie.insert("2001:db8::1").unwrap();
        trie.remove("192.168.1.2").unwrap();
        trie.remove("2001:db8::2").unwrap();
        trie.remove("10.0.0.0/8").unwrap();
        assert_eq!(trie.len(), 2);
        assert!(trie.contains("192.168.1.1"));
        assert!(trie.contains("2001:db8::1"));
        trie.check_invariants();
    }

    #[test]
    fn test_insert_remove_contains_law() {
        for addr in ["192.168.1.1", "10.0.0.0/8", "2001:db8::1", "2001:db8::/32"] {
            let mut trie = IpTrie::new();
            trie.insert(addr).unwrap();
            assert!(trie.contains(addr));
            trie.remove(addr).unwrap();
            assert!(!trie.contains(addr), "{addr} still present after remove");
            assert_eq!(trie.len(), 0);
        }
    }

    #[test]
    fn test_size_accounting() {
        let mut trie = IpTrie::new();
        for insert in ["192.168.1.1", "10.0.0.0/8", "2001:db8::1", "fe80::/10"] {
            trie.insert(insert).unwrap();
        }
        let _ = trie.insert("192.168.1.1"); // duplicate, no size change
        trie.remove("192.168.1.1").unwrap();
        trie.remove("8.8.8.8").unwrap(); // absent, no size change
        assert_eq!(trie.len(), 3);
    }

    #[test]
    fn test_single_bit_prefix() {
        let mut trie = IpTrie::new();
        trie.insert("192.168.1.0/31").unwrap();
        assert!(trie.contains("192.168.1.0"));
        assert!(trie.contains("192.168.1.1"));
        assert!(!trie.contains("192.168.1.2"));
    }

    #[test]
    fn test_overlapping_networks() {
        let mut trie = IpTrie::new();
        trie.insert("10.0.0.0/8").unwrap();
        trie.insert("10.0.0.0/16").unwrap();
        trie.insert("10.0.0.0/24").unwrap();
        assert!(trie.contains("10.0.0.1"));
        assert!(trie.contains("10.0.1.1"));
        assert!(trie.contains("10.1.0.1"));
        assert_eq!(trie.len(), 3);

        // removing the shortest prefix keeps the longer ones reachable
        trie.remove("10.0.0.0/8").unwrap();
        assert!(trie.contains("10.0.0.1"));
        assert!(trie.contains("10.0.1.1"));
        assert!(!trie.contains("10.1.0.1"));
        trie.check_invariants();
    }

    #[test]
    fn test_host_bits_masked() {
        let mut trie = IpTrie::new();
        trie.insert("10.1.2.3/8").unwrap();
        assert!(trie.contains("10.200.0.1"));
        assert!(matches!(
            trie.insert("10.0.0.0/8"),
            Err(TrieError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_compress_path_after_removals() {
        let mut trie = IpTrie::new();
        let entries = [
            "10.0.0.0/8",
            "10.1.0.0/16",
            "10.1.1.0/24",
            "10.1.1.1",
            "10.1.1.2",
            "10.2.0.0/16",
            "192.168.0.0/16",
        ];
        for entry in entries {
            trie.insert(entry).unwrap();
        }
        trie.check_invariants();
        for entry in ["10.1.1.1", "10.1.0.0/16", "10.0.0.0/8", "10.1.1.2"] {
            trie.remove(entry).unwrap();
            trie.check_invariants();
        }
        assert!(trie.contains("10.1.1.42"));
        assert!(!trie.contains("10.3.0.1"));
        assert_eq!(trie.len(), 3);
    }

    #[test]
    fn test_dense_insert_remove_cycle() {
        let mut trie = IpTrie::new();
        let mut entries = Vec::new();
        for a in 0..8 {
            for b in 0..8 {
                entries.push(format!("10.0.{a}.{b}"));
            }
        }
        for entry in &entries {
            trie.insert(entry).unwrap();
        }
        assert_eq!(trie.len(), entries.len());
        for entry in &entries {
            assert!(trie.contains(entry), "{entry}");
        }
        trie.check_invariants();
        for entry in &entries {
            trie.remove(entry).unwrap();
        }
        assert_eq!(trie.len(), 0);
        trie.check_invariants();
    }

    #[test]
    fn test_default_route_entry() {
        let mut trie = IpTrie::new();
        trie.insert("0.0.0.0/0").unwrap();
        assert!(trie.contains("8.8.8.8"));
        trie.remove("0.0.0.0/0").unwrap();
        assert!(!trie.contains("8.8.8.8"));
        assert_eq!(trie.len(), 0);
    }

    #[test]
    fn test_trie_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<IpTrie>();
    }
}
