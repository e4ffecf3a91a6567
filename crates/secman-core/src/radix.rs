//! A compressed prefix tree keyed by strings.
//!
//! Edges carry whole substrings, so a lookup touches one node per diverging
//! prefix rather than one per character. Used by the logical router to map
//! engine root paths to backends.

#[derive(Debug, Clone)]
struct Node<V> {
    label: String,
    value: Option<V>,
    children: Vec<Node<V>>,
}

impl<V> Node<V> {
    fn new(label: String, value: Option<V>) -> Self {
        Self {
            label,
            value,
            children: Vec::new(),
        }
    }

    fn child_index(&self, first: char) -> Option<usize> {
        self.children
            .iter()
            .position(|child| child.label.starts_with(first))
    }
}

/// Length in bytes of the longest common prefix, on a char boundary.
fn common_prefix(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map_or_else(|| a.len().min(b.len()), |((i, _), _)| i)
}

/// A radix tree mapping strings to values.
#[derive(Debug, Clone)]
pub struct RadixTree<V> {
    root: Node<V>,
}

impl<V> Default for RadixTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RadixTree<V> {
    pub fn new() -> Self {
        Self {
            root: Node::new(String::new(), None),
        }
    }

    /// Insert a value, returning the previous value for `key` if any.
    pub fn insert(&mut self, key: &str, value: V) -> Option<V> {
        let mut node = &mut self.root;
        let mut rest = key;
        loop {
            let Some(first) = rest.chars().next() else {
                return node.value.replace(value);
            };

            let Some(idx) = node.child_index(first) else {
                node.children.push(Node::new(rest.to_owned(), Some(value)));
                return None;
            };

            let shared = common_prefix(&node.children[idx].label, rest);
            if shared < node.children[idx].label.len() {
                // Split the edge at the divergence point.
                let child = &mut node.children[idx];
                let suffix = child.label.split_off(shared);
                let mut lower = Node::new(suffix, child.value.take());
                lower.children = std::mem::take(&mut child.children);
                child.children.push(lower);
            }
            node = &mut node.children[idx];
            rest = &rest[shared..];
        }
    }

    /// Exact lookup.
    pub fn get(&self, key: &str) -> Option<&V> {
        let mut node = &self.root;
        let mut rest = key;
        loop {
            let Some(first) = rest.chars().next() else {
                return node.value.as_ref();
            };
            let child = &node.children[node.child_index(first)?];
            rest = rest.strip_prefix(child.label.as_str())?;
            node = child;
        }
    }

    /// Remove a key, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        Self::remove_from(&mut self.root, key)
    }

    fn remove_from(node: &mut Node<V>, rest: &str) -> Option<V> {
        let Some(first) = rest.chars().next() else {
            return node.value.take();
        };
        let idx = node.child_index(first)?;
        let tail = rest.strip_prefix(node.children[idx].label.as_str())?;
        let removed = Self::remove_from(&mut node.children[idx], tail)?;

        let child = &mut node.children[idx];
        if child.value.is_none() {
            match child.children.len() {
                0 => {
                    node.children.remove(idx);
                }
                1 => {
                    // Merge a pass-through node into its only child.
                    if let Some(mut only) = child.children.pop() {
                        child.label.push_str(&only.label);
                        child.value = only.value.take();
                        child.children = std::mem::take(&mut only.children);
                    }
                }
                _ => {}
            }
        }
        Some(removed)
    }

    /// Every stored key that is a prefix of `key`, shortest first.
    fn prefixes_of(&self, key: &str) -> Vec<(String, &V)> {
        let mut found = Vec::new();
        let mut node = &self.root;
        let mut consumed = String::new();
        let mut rest = key;
        loop {
            if let Some(value) = &node.value {
                found.push((consumed.clone(), value));
            }
            let Some(first) = rest.chars().next() else {
                return found;
            };
            let Some(idx) = node.child_index(first) else {
                return found;
            };
            let child = &node.children[idx];
            let Some(tail) = rest.strip_prefix(child.label.as_str()) else {
                return found;
            };
            consumed.push_str(&child.label);
            rest = tail;
            node = child;
        }
    }

    /// The longest stored key that is a prefix of `key`.
    pub fn longest_prefix(&self, key: &str) -> Option<(String, &V)> {
        self.prefixes_of(key).pop()
    }

    /// Visit every entry in insertion-independent order.
    pub fn walk(&self, mut f: impl FnMut(&str, &V)) {
        fn visit<V>(node: &Node<V>, prefix: &mut String, f: &mut impl FnMut(&str, &V)) {
            let mark = prefix.len();
            prefix.push_str(&node.label);
            if let Some(value) = &node.value {
                f(prefix, value);
            }
            let mut children: Vec<&Node<V>> = node.children.iter().collect();
            children.sort_by(|a, b| a.label.cmp(&b.label));
            for child in children {
                visit(child, prefix, f);
            }
            prefix.truncate(mark);
        }
        visit(&self.root, &mut String::new(), &mut f);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn keys(tree: &RadixTree<u32>) -> Vec<String> {
        let mut out = Vec::new();
        tree.walk(|k, _| out.push(k.to_owned()));
        out
    }

    #[test]
    fn insert_and_get() {
        let mut tree = RadixTree::new();
        assert_eq!(tree.insert("secrets/kv", 1), None);
        assert_eq!(tree.insert("secrets/pci_dss", 2), None);
        assert_eq!(tree.insert("auth/logopass", 3), None);
        assert_eq!(tree.insert("secrets", 4), None);

        assert_eq!(tree.get("secrets/kv"), Some(&1));
        assert_eq!(tree.get("secrets/pci_dss"), Some(&2));
        assert_eq!(tree.get("auth/logopass"), Some(&3));
        assert_eq!(tree.get("secrets"), Some(&4));
        assert_eq!(tree.get("secrets/"), None);
        assert_eq!(tree.get("secrets/kv/x"), None);
        assert_eq!(keys(&tree).len(), 4);
    }

    #[test]
    fn insert_replaces_existing() {
        let mut tree = RadixTree::new();
        tree.insert("a", 1);
        assert_eq!(tree.insert("a", 2), Some(1));
        assert_eq!(tree.get("a"), Some(&2));
        assert_eq!(keys(&tree), vec!["a"]);
    }

    #[test]
    fn longest_prefix_prefers_deeper_keys() {
        let mut tree = RadixTree::new();
        tree.insert("secrets/kv", 1);
        tree.insert("secrets/kv/v2", 2);

        assert_eq!(tree.longest_prefix("secrets/kv/v2/foo").unwrap(), ("secrets/kv/v2".to_owned(), &2));
        assert_eq!(tree.longest_prefix("secrets/kv/foo").unwrap(), ("secrets/kv".to_owned(), &1));
        assert!(tree.longest_prefix("auth/x").is_none());

        let all: Vec<_> = tree
            .prefixes_of("secrets/kv/v2/foo")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(all, vec!["secrets/kv", "secrets/kv/v2"]);
    }

    #[test]
    fn remove_merges_nodes() {
        let mut tree = RadixTree::new();
        tree.insert("secrets/kv", 1);
        tree.insert("secrets/pci_dss", 2);
        tree.insert("secrets/blobs", 3);

        assert_eq!(tree.remove("secrets/pci_dss"), Some(2));
        assert_eq!(tree.remove("secrets/pci_dss"), None);
        assert_eq!(tree.remove("secrets"), None);
        assert_eq!(tree.get("secrets/kv"), Some(&1));
        assert_eq!(tree.get("secrets/blobs"), Some(&3));
        assert_eq!(keys(&tree), vec!["secrets/blobs", "secrets/kv"]);

        assert_eq!(tree.remove("secrets/kv"), Some(1));
        assert_eq!(keys(&tree), vec!["secrets/blobs"]);
    }

    #[test]
    fn walk_is_sorted() {
        let mut tree = RadixTree::new();
        for (i, key) in ["b", "a/2", "a/1", "a"].iter().enumerate() {
            tree.insert(key, u32::try_from(i).unwrap());
        }
        assert_eq!(keys(&tree), vec!["a", "a/1", "a/2", "b"]);
    }

    #[test]
    fn common_prefix_respects_char_boundaries() {
        assert_eq!(common_prefix("abc", "abd"), 2);
        assert_eq!(common_prefix("ab", "abc"), 2);
        assert_eq!(common_prefix("é1", "é2"), 2);
        assert_eq!(common_prefix("", "a"), 0);
    }
}
