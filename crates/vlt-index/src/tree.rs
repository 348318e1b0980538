//! Path trie derived from the index arena
//!
//! The tree is a cache: it is never persisted and can always be rebuilt from
//! the slots. Leaves point back into the arena by slot position.

use std::collections::BTreeMap;

use crate::element::Slot;
use crate::path::components;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexTreeNode {
    pub name: String,
    /// Arena position of the file at this node
    pub element: Option<usize>,
    pub children: BTreeMap<String, IndexTreeNode>,
}

impl IndexTreeNode {
    pub fn root() -> Self {
        Self {
            name: "/".into(),
            ..Default::default()
        }
    }

    /// Build a tree over every live slot.
    pub fn build(slots: &[Slot]) -> Self {
        let mut root = Self::root();
        for (pos, slot) in slots.iter().enumerate() {
            if let Some(el) = slot.live() {
                root.insert(&el.path, pos);
            }
        }
        root
    }

    pub fn is_dir(&self) -> bool {
        !self.children.is_empty()
    }

    /// Insert a file, creating intermediate folders.
    pub fn insert(&mut self, path: &str, position: usize) {
        let mut node = self;
        for name in components(path) {
            node = node
                .children
                .entry(name.to_string())
                .or_insert_with(|| IndexTreeNode {
                    name: name.to_string(),
                    ..Default::default()
                });
        }
        node.element = Some(position);
    }

    pub fn find(&self, path: &str) -> Option<&IndexTreeNode> {
        let mut node = self;
        for name in components(path) {
            node = node.children.get(name)?;
        }
        Some(node)
    }

    /// First strict ancestor of `path` that is a file, if any.
    pub fn file_ancestor(&self, path: &str) -> Option<usize> {
        let mut node = self;
        let mut names = components(path).peekable();
        while let Some(name) = names.next() {
            if names.peek().is_none() {
                break;
            }
            node = node.children.get(name)?;
            if node.element.is_some() {
                return node.element;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::IndexElement;
    use uuid::Uuid;

    fn live(path: &str) -> Slot {
        Slot::Live(IndexElement::new(Uuid::new_v4(), path, "text/plain", 1, 0))
    }

    #[test]
    fn test_build_skips_tombstones() {
        let slots = vec![live("/a/b.txt"), Slot::Tombstone, live("/a/c/d.txt"), live("/e")];
        let tree = IndexTreeNode::build(&slots);

        assert_eq!(tree.find("/a/b.txt").unwrap().element, Some(0));
        assert_eq!(tree.find("/a/c/d.txt").unwrap().element, Some(2));
        assert_eq!(tree.find("/e").unwrap().element, Some(3));

        let a = tree.find("/a").unwrap();
        assert!(a.is_dir());
        assert!(a.element.is_none());
        assert_eq!(
            a.children.keys().collect::<Vec<_>>(),
            vec!["b.txt", "c"]
        );
        assert!(tree.find("/missing").is_none());
        assert!(std::ptr::eq(tree.find("/").unwrap(), &tree));
    }

    #[test]
    fn test_file_ancestor() {
        let tree = IndexTreeNode::build(&[live("/a"), live("/b/c")]);
        assert_eq!(tree.file_ancestor("/a/x"), Some(0));
        assert_eq!(tree.file_ancestor("/a/x/y"), Some(0));
        assert_eq!(tree.file_ancestor("/b/c"), None);
        assert_eq!(tree.file_ancestor("/b/d"), None);
        assert_eq!(tree.file_ancestor("/a"), None);
    }
}
