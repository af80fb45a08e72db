//! Longest-prefix-match container keyed by CIDR ranges.
//!
//! An [`AddressMatcher`] is built once from a list of `(value, ranges)` pairs
//! and is read-only afterwards. A lookup returns the value whose range is the
//! most specific match for the address, so at most one value is ever returned.

use std::net::IpAddr;

use crate::{address_bits, CidrRange, NetworkError};

#[derive(Debug, Clone, Default)]
struct TrieNode {
    children: [Option<u32>; 2],
    value: Option<usize>,
}

/// Uncompressed binary trie over left-aligned address bits.
#[derive(Debug, Clone)]
struct PrefixTrie {
    nodes: Vec<TrieNode>,
}

impl PrefixTrie {
    fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
        }
    }

    /// Insert a prefix. Returns the index already stored at the same prefix
    /// if it differs from `value`.
    fn insert(&mut self, bits: u128, prefix_len: u8, value: usize) -> Result<(), usize> {
        let mut node = 0usize;
        for depth in 0..prefix_len {
            let bit = ((bits >> (127 - depth)) & 1) as usize;
            node = match self.nodes[node].children[bit] {
                Some(next) => next as usize,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[node].children[bit] = Some(next as u32);
                    next
                }
            };
        }

        match self.nodes[node].value {
            Some(existing) if existing != value => Err(existing),
            _ => {
                self.nodes[node].value = Some(value);
                Ok(())
            }
        }
    }

    fn longest_match(&self, bits: u128, width: u8) -> Option<usize> {
        let mut node = 0usize;
        let mut best = self.nodes[0].value;
        for depth in 0..width {
            let bit = ((bits >> (127 - depth)) & 1) as usize;
            match self.nodes[node].children[bit] {
                Some(next) => {
                    node = next as usize;
                    if let Some(value) = self.nodes[node].value {
                        best = Some(value);
                    }
                }
                None => break,
            }
        }
        best
    }
}

/// Read-only longest-prefix-match table.
#[derive(Debug, Clone)]
pub struct AddressMatcher<T> {
    values: Vec<T>,
    v4: PrefixTrie,
    v6: PrefixTrie,
}

impl<T> AddressMatcher<T> {
    /// Build a matcher from values and the ranges each one covers.
    ///
    /// A value may cover several ranges (the catch-all entry covers both
    /// `0.0.0.0/0` and `::/0`). Two different values registered at the exact
    /// same prefix are rejected.
    pub fn new<I>(entries: I) -> Result<Self, NetworkError>
    where
        I: IntoIterator<Item = (T, Vec<CidrRange>)>,
    {
        let mut values = Vec::new();
        let mut v4 = PrefixTrie::new();
        let mut v6 = PrefixTrie::new();

        for (value, ranges) in entries {
            let index = values.len();
            values.push(value);

            for range in ranges {
                let trie = if range.is_ipv4() { &mut v4 } else { &mut v6 };
                trie.insert(address_bits(range.address()), range.prefix_len(), index)
                    .map_err(|_| NetworkError::DuplicatePrefix(range.to_string()))?;
            }
        }

        Ok(Self { values, v4, v6 })
    }

    /// Value of the most specific range containing `addr`.
    pub fn get(&self, addr: IpAddr) -> Option<&T> {
        let index = match addr {
            IpAddr::V4(_) => self.v4.longest_match(address_bits(addr), 32),
            IpAddr::V6(_) => self.v6.longest_match(address_bits(addr), 128),
        }?;
        self.values.get(index)
    }

    /// Iterate over every stored value.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
