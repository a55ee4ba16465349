//! AVL tree keyed by object id, augmented for smallest-free-id allocation.
//!
//! Every node carries, besides the usual AVL height, the key range of its subtree and the length
//! of the largest run of unused ids inside its left and right regions:
//!
//! - `gap_left`: largest free run in `[min, key)`, i.e. inside the left child or between the left
//!   child's largest key and `key`.
//! - `gap_right`: largest free run in `(key, max]`, i.e. between `key` and the right child's
//!   smallest key or inside the right child.
//!
//! With those two numbers the allocator walks a single root-to-leaf path to find the lowest
//! unused id. All annotations are maintained by [`GapTree::fix_up`], which is the only routine
//! that writes them and is called by both rotations and on every node touched by an insert or
//! remove.

use slotmap::SlotMap;

slotmap::new_key_type! {
    struct NodeKey;
}

struct Node<V> {
    key: u32,
    value: V,
    left: Option<NodeKey>,
    right: Option<NodeKey>,
    height: u8,
    min: u32,
    max: u32,
    gap_left: u32,
    gap_right: u32,
}

impl<V> Node<V> {
    fn leaf(key: u32, value: V) -> Self {
        Self {
            key,
            value,
            left: None,
            right: None,
            height: 1,
            min: key,
            max: key,
            gap_left: 0,
            gap_right: 0,
        }
    }

    /// Largest free run strictly between `min` and `max`.
    fn inner_gap(&self) -> u32 {
        self.gap_left.max(self.gap_right)
    }
}

/// Balanced search tree mapping `u32` ids to values, with O(log n) lookup, removal, and
/// smallest-unused-id allocation.
pub struct GapTree<V> {
    nodes: SlotMap<NodeKey, Node<V>>,
    root: Option<NodeKey>,
}

impl<V> Default for GapTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> GapTree<V> {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            root: None,
        }
    }

    /// Number of ids currently present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds no ids.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Looks up the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: u32) -> Option<&V> {
        let mut cursor = self.root;
        while let Some(k) = cursor {
            let node = &self.nodes[k];
            cursor = match key.cmp(&node.key) {
                std::cmp::Ordering::Less => node.left,
                std::cmp::Ordering::Greater => node.right,
                std::cmp::Ordering::Equal => return Some(&node.value),
            };
        }
        None
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains(&self, key: u32) -> bool {
        self.get(key).is_some()
    }

    /// Returns the smallest id not present in the tree.
    ///
    /// Returns `None` only when every id up to and including `u32::MAX` is taken.
    #[must_use]
    pub fn smallest_free(&self) -> Option<u32> {
        let Some(root) = self.root else {
            return Some(0);
        };
        let top = &self.nodes[root];
        if top.min > 0 {
            return Some(0);
        }
        match self.first_interior_gap(root) {
            Some(id) => Some(id),
            None => top.max.checked_add(1),
        }
    }

    /// Finds the lowest free id strictly inside the key range of the subtree at `start`.
    fn first_interior_gap(&self, start: NodeKey) -> Option<u32> {
        let mut cursor = start;
        loop {
            let node = &self.nodes[cursor];
            if node.gap_left > 0 {
                let left = &self.nodes[node.left?];
                if left.inner_gap() > 0 {
                    cursor = node.left?;
                    continue;
                }
                return Some(left.max + 1);
            }
            if node.gap_right > 0 {
                let right = node.right?;
                if self.nodes[right].min > node.key + 1 {
                    return Some(node.key + 1);
                }
                cursor = right;
                continue;
            }
            return None;
        }
    }

    /// Inserts `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns the value back if `key` is already present.
    pub fn insert(&mut self, key: u32, value: V) -> Result<(), V> {
        if self.contains(key) {
            return Err(value);
        }
        let root = self.insert_at(self.root, key, value);
        self.root = Some(root);
        Ok(())
    }

    /// Allocates the smallest free id below `limit`, stores `make(id)` under it, and returns
    /// the id. Returns `None` if no id below `limit` is free.
    pub fn insert_smallest_free(&mut self, limit: u32, make: impl FnOnce(u32) -> V) -> Option<u32> {
        let id = self.smallest_free().filter(|id| *id < limit)?;
        let root = self.insert_at(self.root, id, make(id));
        self.root = Some(root);
        Some(id)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&mut self, key: u32) -> Option<V> {
        let (root, removed) = self.remove_at(self.root, key);
        self.root = root;
        removed
    }

    /// In-order iterator over `(id, value)` pairs.
    pub fn iter(&self) -> Iter<'_, V> {
        let mut iter = Iter {
            tree: self,
            stack: Vec::new(),
        };
        iter.push_left_spine(self.root);
        iter
    }

    fn height(&self, node: Option<NodeKey>) -> u8 {
        node.map_or(0, |k| self.nodes[k].height)
    }

    /// Recomputes height, key range, and gap annotations of `k` from its children.
    fn fix_up(&mut self, k: NodeKey) {
        let (key, left, right) = {
            let node = &self.nodes[k];
            (node.key, node.left, node.right)
        };
        let (left_height, min, gap_left) = match left {
            Some(l) => {
                let child = &self.nodes[l];
                (
                    child.height,
                    child.min,
                    child.inner_gap().max(key - child.max - 1),
                )
            }
            None => (0, key, 0),
        };
        let (right_height, max, gap_right) = match right {
            Some(r) => {
                let child = &self.nodes[r];
                (
                    child.height,
                    child.max,
                    child.inner_gap().max(child.min - key - 1),
                )
            }
            None => (0, key, 0),
        };

        let node = &mut self.nodes[k];
        node.height = 1 + left_height.max(right_height);
        node.min = min;
        node.max = max;
        node.gap_left = gap_left;
        node.gap_right = gap_right;
    }

    fn rotate_right(&mut self, k: NodeKey) -> NodeKey {
        let Some(pivot) = self.nodes[k].left else {
            return k;
        };
        self.nodes[k].left = self.nodes[pivot].right;
        self.nodes[pivot].right = Some(k);
        self.fix_up(k);
        self.fix_up(pivot);
        pivot
    }

    fn rotate_left(&mut self, k: NodeKey) -> NodeKey {
        let Some(pivot) = self.nodes[k].right else {
            return k;
        };
        self.nodes[k].right = self.nodes[pivot].left;
        self.nodes[pivot].left = Some(k);
        self.fix_up(k);
        self.fix_up(pivot);
        pivot
    }

    /// Restores the AVL balance at `k` and returns the new subtree root.
    fn balance(&mut self, k: NodeKey) -> NodeKey {
        self.fix_up(k);
        let (left, right) = (self.nodes[k].left, self.nodes[k].right);
        let skew = i16::from(self.height(left)) - i16::from(self.height(right));

        if skew > 1 {
            if let Some(l) = left {
                let (ll, lr) = (self.nodes[l].left, self.nodes[l].right);
                if self.height(ll) < self.height(lr) {
                    let rotated = self.rotate_left(l);
                    self.nodes[k].left = Some(rotated);
                }
            }
            return self.rotate_right(k);
        }
        if skew < -1 {
            if let Some(r) = right {
                let (rl, rr) = (self.nodes[r].left, self.nodes[r].right);
                if self.height(rr) < self.height(rl) {
                    let rotated = self.rotate_right(r);
                    self.nodes[k].right = Some(rotated);
                }
            }
            return self.rotate_left(k);
        }
        k
    }

    fn insert_at(&mut self, node: Option<NodeKey>, key: u32, value: V) -> NodeKey {
        let Some(k) = node else {
            return self.nodes.insert(Node::leaf(key, value));
        };
        if key < self.nodes[k].key {
            let child = self.insert_at(self.nodes[k].left, key, value);
            self.nodes[k].left = Some(child);
        } else {
            debug_assert_ne!(key, self.nodes[k].key, "duplicate key {key}");
            let child = self.insert_at(self.nodes[k].right, key, value);
            self.nodes[k].right = Some(child);
        }
        self.balance(k)
    }

    fn remove_at(&mut self, node: Option<NodeKey>, key: u32) -> (Option<NodeKey>, Option<V>) {
        let Some(k) = node else {
            return (None, None);
        };
        match key.cmp(&self.nodes[k].key) {
            std::cmp::Ordering::Less => {
                let (child, removed) = self.remove_at(self.nodes[k].left, key);
                self.nodes[k].left = child;
                return (Some(self.balance(k)), removed);
            }
            std::cmp::Ordering::Greater => {
                let (child, removed) = self.remove_at(self.nodes[k].right, key);
                self.nodes[k].right = child;
                return (Some(self.balance(k)), removed);
            }
            std::cmp::Ordering::Equal => {}
        }

        let Some(node) = self.nodes.remove(k) else {
            return (None, None);
        };
        let replacement = match (node.left, node.right) {
            (None, None) => None,
            (Some(only), None) | (None, Some(only)) => Some(only),
            (Some(left), Some(right)) => {
                let (rest, successor) = self.detach_min(right);
                self.nodes[successor].left = Some(left);
                self.nodes[successor].right = rest;
                Some(self.balance(successor))
            }
        };
        (replacement, Some(node.value))
    }

    /// Unlinks the leftmost node of the subtree at `k`.
    ///
    /// Returns the rebalanced remainder of the subtree and the detached node, whose links are
    /// left for the caller to overwrite.
    fn detach_min(&mut self, k: NodeKey) -> (Option<NodeKey>, NodeKey) {
        match self.nodes[k].left {
            None => (self.nodes[k].right, k),
            Some(left) => {
                let (rest, min) = self.detach_min(left);
                self.nodes[k].left = rest;
                (Some(self.balance(k)), min)
            }
        }
    }

    /// Recomputes every annotation from scratch and compares it with the stored one.
    ///
    /// Intended for tests only.
    ///
    /// # Errors
    ///
    /// Describes the first node whose ordering, balance, or annotations are stale.
    #[doc(hidden)]
    pub fn check_invariants(&self) -> Result<(), String> {
        let counted = self.check_subtree(self.root, None, None)?.map_or(0, |s| s.count);
        if counted != self.nodes.len() {
            return Err(format!(
                "{} nodes reachable from the root, {} allocated",
                counted,
                self.nodes.len()
            ));
        }
        Ok(())
    }

    fn check_subtree(
        &self,
        node: Option<NodeKey>,
        lower: Option<u32>,
        upper: Option<u32>,
    ) -> Result<Option<Summary>, String> {
        let Some(k) = node else {
            return Ok(None);
        };
        let n = &self.nodes[k];
        if lower.is_some_and(|lo| n.key <= lo) || upper.is_some_and(|hi| n.key >= hi) {
            return Err(format!("key {} out of order", n.key));
        }
        let left = self.check_subtree(n.left, lower, Some(n.key))?;
        let right = self.check_subtree(n.right, Some(n.key), upper)?;

        let left_height = left.as_ref().map_or(0, |s| s.height);
        let right_height = right.as_ref().map_or(0, |s| s.height);
        if left_height.abs_diff(right_height) > 1 {
            return Err(format!("node {} is unbalanced", n.key));
        }
        let gap_left = left
            .as_ref()
            .map_or(0, |s| s.inner.max(n.key - s.max - 1));
        let gap_right = right
            .as_ref()
            .map_or(0, |s| s.inner.max(s.min - n.key - 1));
        let summary = Summary {
            height: 1 + left_height.max(right_height),
            min: left.as_ref().map_or(n.key, |s| s.min),
            max: right.as_ref().map_or(n.key, |s| s.max),
            inner: gap_left.max(gap_right),
            count: 1 + left.map_or(0, |s| s.count) + right.map_or(0, |s| s.count),
        };

        if n.height != summary.height {
            return Err(format!("node {} has stale height", n.key));
        }
        if n.min != summary.min || n.max != summary.max {
            return Err(format!("node {} has a stale key range", n.key));
        }
        if n.gap_left != gap_left || n.gap_right != gap_right {
            return Err(format!(
                "node {} has gaps ({}, {}), expected ({gap_left}, {gap_right})",
                n.key, n.gap_left, n.gap_right
            ));
        }
        Ok(Some(summary))
    }
}

struct Summary {
    height: u8,
    min: u32,
    max: u32,
    inner: u32,
    count: usize,
}

/// In-order iterator returned by [`GapTree::iter`].
pub struct Iter<'a, V> {
    tree: &'a GapTree<V>,
    stack: Vec<NodeKey>,
}

impl<V> Iter<'_, V> {
    fn push_left_spine(&mut self, mut cursor: Option<NodeKey>) {
        while let Some(k) = cursor {
            self.stack.push(k);
            cursor = self.tree.nodes[k].left;
        }
    }
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (u32, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let k = self.stack.pop()?;
        let tree = self.tree;
        let node = &tree.nodes[k];
        self.push_left_spine(node.right);
        Some((node.key, &node.value))
    }
}
