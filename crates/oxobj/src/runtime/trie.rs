//! Persistent dispatch trie.
//!
//! A [`DispatchTrie`] maps 24-bit keys (selector tokens) to values through
//! three levels of 256-way nodes. Nodes are reference counted and shared
//! between tries: cloning a trie is O(1), and [`insert`](DispatchTrie::insert)
//! copies only the nodes on the path it writes (`Arc::make_mut`), leaving
//! every other subtree shared with the tries it was cloned from.
//!
//! Never-populated subtrees are `None`. Lookups take no locks; a published
//! trie is immutable, writers build a new one and swap it in.
//!
//! ```
//! use oxobj::runtime::trie::DispatchTrie;
//!
//! let mut base = DispatchTrie::new();
//! base.insert(7, "base");
//!
//! let mut derived = base.clone();
//! assert!(derived.shares_root_with(&base));
//!
//! derived.insert(7, "derived");
//! assert_eq!(base.lookup(7), Some(&"base"));
//! assert_eq!(derived.lookup(7), Some(&"derived"));
//! ```

use std::fmt;
use std::sync::Arc;

/// Bits consumed per level.
const LEVEL_BITS: u32 = 8;

/// Children per node.
const FANOUT: usize = 1 << LEVEL_BITS;

const LEVEL_MASK: u32 = (FANOUT as u32) - 1;

/// Number of keys the trie can hold (keys are `0..KEY_SPACE`).
pub const KEY_SPACE: u32 = 1 << (3 * LEVEL_BITS);

type Link<T> = Option<Arc<Node<T>>>;

#[derive(Clone)]
enum Node<T> {
    Branch(Box<[Link<T>; FANOUT]>),
    Leaf(Box<[Option<T>; FANOUT]>),
}

impl<T> Node<T> {
    fn branch() -> Self {
        Node::Branch(Box::new(std::array::from_fn(|_| None)))
    }

    fn leaf() -> Self {
        Node::Leaf(Box::new(std::array::from_fn(|_| None)))
    }
}

#[inline]
const fn split(key: u32) -> (usize, usize, usize) {
    (
        ((key >> (2 * LEVEL_BITS)) & LEVEL_MASK) as usize,
        ((key >> LEVEL_BITS) & LEVEL_MASK) as usize,
        (key & LEVEL_MASK) as usize,
    )
}

/// Copy-on-write map from 24-bit keys to `T`.
pub struct DispatchTrie<T> {
    root: Link<T>,
    len: usize,
}

impl<T> DispatchTrie<T> {
    /// Creates an empty trie. Allocates nothing until the first insert.
    #[must_use]
    pub const fn new() -> Self {
        Self { root: None, len: 0 }
    }

    /// Number of keys present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no key is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Looks up `key`.
    #[must_use]
    #[inline]
    pub fn lookup(&self, key: u32) -> Option<&T> {
        if key >= KEY_SPACE {
            return None;
        }
        let (a, b, c) = split(key);
        let Node::Branch(top) = self.root.as_deref()? else {
            return None;
        };
        let Node::Branch(mid) = top[a].as_deref()? else {
            return None;
        };
        let Node::Leaf(leaf) = mid[b].as_deref()? else {
            return None;
        };
        leaf[c].as_ref()
    }

    /// Returns true if both tries currently share their root node.
    #[must_use]
    pub fn shares_root_with(&self, other: &Self) -> bool {
        match (&self.root, &other.root) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Returns the first entry whose key is `>= *cursor` and advances the
    /// cursor past it. Start with a cursor of `0`.
    pub fn next(&self, cursor: &mut u32) -> Option<(u32, &T)> {
        let Some(Node::Branch(top)) = self.root.as_deref() else {
            return None;
        };
        while *cursor < KEY_SPACE {
            let (a, b, c) = split(*cursor);
            let Some(Node::Branch(mid)) = top[a].as_deref() else {
                *cursor = ((a as u32) + 1) << (2 * LEVEL_BITS);
                continue;
            };
            let Some(Node::Leaf(leaf)) = mid[b].as_deref() else {
                *cursor = (((a as u32) << LEVEL_BITS) + (b as u32) + 1) << LEVEL_BITS;
                continue;
            };
            if let Some(i) = (c..FANOUT).find(|&i| leaf[i].is_some()) {
                let key = (*cursor & !LEVEL_MASK) | i as u32;
                *cursor = key + 1;
                return leaf[i].as_ref().map(|v| (key, v));
            }
            *cursor = (*cursor | LEVEL_MASK) + 1;
        }
        None
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            trie: self,
            cursor: 0,
        }
    }
}

impl<T: Clone> DispatchTrie<T> {
    /// Inserts `value` at `key`, returning the previous value.
    ///
    /// Shared nodes on the path are cloned first; other tries never observe
    /// the write.
    ///
    /// # Panics
    ///
    /// Panics if `key >= KEY_SPACE`.
    pub fn insert(&mut self, key: u32, value: T) -> Option<T> {
        assert!(key < KEY_SPACE, "dispatch key {key} out of range");
        let (a, b, c) = split(key);

        let root = Arc::make_mut(self.root.get_or_insert_with(|| Arc::new(Node::branch())));
        let Node::Branch(top) = root else {
            unreachable!("trie root is always a branch");
        };
        let mid = Arc::make_mut(top[a].get_or_insert_with(|| Arc::new(Node::branch())));
        let Node::Branch(mid) = mid else {
            unreachable!("second trie level is always a branch");
        };
        let leaf = Arc::make_mut(mid[b].get_or_insert_with(|| Arc::new(Node::leaf())));
        let Node::Leaf(leaf) = leaf else {
            unreachable!("third trie level is always a leaf");
        };

        let previous = leaf[c].replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }
}

impl<T> Clone for DispatchTrie<T> {
    /// O(1): shares every node with `self`.
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<T> Default for DispatchTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for DispatchTrie<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Ordered iterator over a [`DispatchTrie`].
pub struct Iter<'a, T> {
    trie: &'a DispatchTrie<T>,
    cursor: u32,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (u32, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        self.trie.next(&mut self.cursor)
    }
}

impl<'a, T> IntoIterator for &'a DispatchTrie<T> {
    type Item = (u32, &'a T);
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let trie: DispatchTrie<u32> = DispatchTrie::new();
        assert!(trie.is_empty());
        assert_eq!(trie.lookup(0), None);
        assert_eq!(trie.lookup(KEY_SPACE), None);
        assert_eq!(trie.iter().count(), 0);
    }

    #[test]
    fn test_insert_and_lookup_across_levels() {
        let mut trie = DispatchTrie::new();
        for key in [0, 1, 255, 256, 65_535, 65_536, KEY_SPACE - 1] {
            assert_eq!(trie.insert(key, key * 2), None);
        }
        assert_eq!(trie.len(), 7);
        assert_eq!(trie.lookup(65_536), Some(&131_072));
        assert_eq!(trie.lookup(2), None);
        assert_eq!(trie.insert(1, 99), Some(2));
        assert_eq!(trie.len(), 7);
    }

    #[test]
    fn test_copy_is_isolated() {
        let mut base = DispatchTrie::new();
        base.insert(10, "a");
        base.insert(70_000, "b");

        let mut copy = base.clone();
        assert!(copy.shares_root_with(&base));
        copy.insert(10, "c");
        copy.insert(11, "d");

        assert!(!copy.shares_root_with(&base));
        assert_eq!(base.lookup(10), Some(&"a"));
        assert_eq!(base.lookup(11), None);
        assert_eq!(copy.lookup(10), Some(&"c"));
        assert_eq!(copy.lookup(70_000), Some(&"b"));
        assert_eq!(base.len(), 2);
        assert_eq!(copy.len(), 3);
    }

    #[test]
    fn test_untouched_subtrees_stay_shared() {
        let mut base = DispatchTrie::new();
        base.insert(5, 1);
        base.insert(1 << 16, 2);

        let mut copy = base.clone();
        copy.insert(6, 3);

        let (Some(Node::Branch(a)), Some(Node::Branch(b))) =
            (base.root.as_deref(), copy.root.as_deref())
        else {
            panic!("roots are branches");
        };
        assert!(!Arc::ptr_eq(a[0].as_ref().unwrap(), b[0].as_ref().unwrap()));
        assert!(Arc::ptr_eq(a[1].as_ref().unwrap(), b[1].as_ref().unwrap()));
    }

    #[test]
    fn test_next_enumerates_in_order() {
        let mut trie = DispatchTrie::new();
        let keys = [300_000, 3, 256, 70_000, 2, 65_536];
        for key in keys {
            trie.insert(key, ());
        }
        let mut sorted = keys.to_vec();
        sorted.sort_unstable();

        let mut cursor = 0;
        let mut seen = Vec::new();
        while let Some((key, ())) = trie.next(&mut cursor) {
            seen.push(key);
        }
        assert_eq!(seen, sorted);

        let mut cursor = 257;
        assert_eq!(trie.next(&mut cursor).map(|(k, _)| k), Some(65_536));
        assert_eq!(cursor, 65_537);
    }

    #[test]
    fn test_dropping_copy_keeps_original() {
        let mut base = DispatchTrie::new();
        base.insert(42, String::from("kept"));
        {
            let mut copy = base.clone();
            copy.insert(43, String::from("temp"));
        }
        assert_eq!(base.lookup(42).map(String::as_str), Some("kept"));
        assert_eq!(base.lookup(43), None);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_key_out_of_range() {
        let mut trie = DispatchTrie::new();
        trie.insert(KEY_SPACE, 0u8);
    }
}
