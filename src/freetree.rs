//! An intrusive AVL tree over the currently free blocks.
//!
//! The allocator cannot allocate memory for its own bookkeeping, so the tree
//! stores its nodes *inside* the blocks it tracks: while a block is free, the
//! first bytes of its payload hold a [`FreeNode`] record. The minimum block
//! size guarantees every free payload has room for one.
//!
//! Nodes are keyed by `(size, address)`. Comparing by size first makes a
//! best-fit search a single root-to-leaf descent; tie-breaking by the node's
//! own address gives a strict total order without any extra storage, since no
//! two nodes can share an address. Address comparison is unsigned.
//!
//! The tree is height-balanced: each node caches its height (a leaf has
//! height 1), and every insert or remove rebalances on the way back up so
//! that `|height(right) - height(left)| <= 1` holds at every node.

use core::cmp::Ordering;
use core::fmt;
use core::ptr::NonNull;

/// Bookkeeping record living in the payload of a free block.
///
/// `size` is a cached copy of the block size from the boundary tags; it must
/// match the header for as long as the node is in the tree (the facade
/// removes a node before resizing its block).
#[repr(C)]
pub struct FreeNode {
    size: usize,
    height: usize,
    left: Link,
    right: Link,
}

impl FreeNode {
    const fn new(size: usize) -> FreeNode {
        FreeNode {
            size,
            height: 1,
            left: None,
            right: None,
        }
    }
}

type Link = Option<NodeRef>;

/// A non-null pointer to a [`FreeNode`]. Plain address, no ownership;
/// equality is pointer identity.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct NodeRef(NonNull<FreeNode>);

impl NodeRef {
    /// Reinterpret a free block's payload as its node record.
    ///
    /// # Safety
    ///
    /// `payload` must point to the payload of a free block whose record has
    /// been initialized (by [`FreeTree::insert`]) or is about to be.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NodeRef {
        NodeRef(payload.cast())
    }

    /// The payload address this node lives at.
    pub fn payload(self) -> NonNull<u8> {
        self.0.cast()
    }

    fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub unsafe fn size(self) -> usize {
        (*self.0.as_ptr()).size
    }

    unsafe fn height(self) -> usize {
        (*self.0.as_ptr()).height
    }

    unsafe fn left(self) -> Link {
        (*self.0.as_ptr()).left
    }

    unsafe fn right(self) -> Link {
        (*self.0.as_ptr()).right
    }

    unsafe fn set_left(self, link: Link) {
        (*self.0.as_ptr()).left = link;
    }

    unsafe fn set_right(self, link: Link) {
        (*self.0.as_ptr()).right = link;
    }

    unsafe fn update_height(self) {
        let h = 1 + max(height(self.left()), height(self.right()));
        (*self.0.as_ptr()).height = h;
    }
}

fn max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// Compare two nodes by `(size, address)`.
unsafe fn cmp(a: NodeRef, b: NodeRef) -> Ordering {
    match a.size().cmp(&b.size()) {
        Ordering::Equal => a.addr().cmp(&b.addr()),
        ord => ord,
    }
}

/// Height of a subtree; a missing child has height 0.
unsafe fn height(link: Link) -> usize {
    match link {
        None => 0,
        Some(n) => n.height(),
    }
}

/// Balance factor: `height(right) - height(left)`.
unsafe fn balance(link: Link) -> isize {
    match link {
        None => 0,
        Some(n) => height(n.right()) as isize - height(n.left()) as isize,
    }
}

/// Left rotation. No-op if there is no right child.
unsafe fn rotate_left(root: NodeRef) -> NodeRef {
    let new_root = match root.right() {
        None => return root,
        Some(n) => n,
    };

    root.set_right(new_root.left());
    new_root.set_left(Some(root));

    root.update_height();
    new_root.update_height();

    new_root
}

/// Right rotation. No-op if there is no left child.
unsafe fn rotate_right(root: NodeRef) -> NodeRef {
    let new_root = match root.left() {
        None => return root,
        Some(n) => n,
    };

    root.set_left(new_root.right());
    new_root.set_right(Some(root));

    root.update_height();
    new_root.update_height();

    new_root
}

/// Insert `node` below `root` and return the new subtree root.
///
/// `node` must be freshly initialized (height 1, no children) and must not
/// already be in the tree.
unsafe fn insert_at(root: Link, node: NodeRef) -> NodeRef {
    let r = match root {
        None => return node,
        Some(r) => r,
    };

    if cmp(node, r) == Ordering::Less {
        r.set_left(Some(insert_at(r.left(), node)));
    } else {
        r.set_right(Some(insert_at(r.right(), node)));
    }

    r.update_height();

    // After a single insertion the taller grandchild determines the rotation;
    // the child's balance is strictly signed here (compare `remove_at`).
    let b = balance(Some(r));
    if b < -1 && balance(r.left()) < 0 {
        rotate_right(r)
    } else if b > 1 && balance(r.right()) > 0 {
        rotate_left(r)
    } else if b < -1 && balance(r.left()) > 0 {
        r.set_left(r.left().map(|n| unsafe { rotate_left(n) }));
        rotate_right(r)
    } else if b > 1 && balance(r.right()) < 0 {
        r.set_right(r.right().map(|n| unsafe { rotate_right(n) }));
        rotate_left(r)
    } else {
        r
    }
}

/// Leftmost node of a subtree.
unsafe fn min_node(root: NodeRef) -> NodeRef {
    let mut current = root;
    while let Some(left) = current.left() {
        current = left;
    }
    current
}

/// Remove the node with `node`'s key from the subtree at `root` and return
/// the new subtree root. Because keys include the address, the match is the
/// node itself.
unsafe fn remove_at(root: Link, node: NodeRef) -> Link {
    let mut r = match root {
        None => return None,
        Some(r) => r,
    };

    match cmp(node, r) {
        Ordering::Less => r.set_left(remove_at(r.left(), node)),
        Ordering::Greater => r.set_right(remove_at(r.right(), node)),
        Ordering::Equal => match (r.left(), r.right()) {
            (None, None) => return None,
            (Some(child), None) | (None, Some(child)) => r = child,
            (Some(left), Some(right)) => {
                // Promote the in-order successor: detach it from the right
                // subtree first, then graft it over this node with the
                // original left subtree and the post-detachment right.
                let succ = min_node(right);
                let pruned_right = remove_at(Some(right), succ);
                succ.set_left(Some(left));
                succ.set_right(pruned_right);
                r = succ;
            }
        },
    }

    r.update_height();

    // Removal can shorten a subtree without telling us which grandchild got
    // taller, so the child balance check admits 0 (compare `insert_at`).
    let b = balance(Some(r));
    let r = if b < -1 && balance(r.left()) <= 0 {
        rotate_right(r)
    } else if b > 1 && balance(r.right()) >= 0 {
        rotate_left(r)
    } else if b < -1 && balance(r.left()) > 0 {
        r.set_left(r.left().map(|n| unsafe { rotate_left(n) }));
        rotate_right(r)
    } else if b > 1 && balance(r.right()) < 0 {
        r.set_right(r.right().map(|n| unsafe { rotate_right(n) }));
        rotate_left(r)
    } else {
        r
    };

    Some(r)
}

/// Best-fit descent: the node with the smallest size `>= size`, ties broken
/// toward the smallest address. Returns `None` if no node is large enough.
unsafe fn best_fit_at(root: Link, size: usize) -> Option<NodeRef> {
    let mut best = None;
    let mut current = root;

    while let Some(n) = current {
        if n.size() >= size {
            best = Some(n);
            current = n.left();
        } else {
            current = n.right();
        }
    }

    best
}

/// The set of free blocks, indexed for best-fit lookup.
///
/// The tree owns the payload bytes of every block whose node is in it; a node
/// is either out of the tree or in it at exactly one position, and only
/// [`FreeTree::insert`] and [`FreeTree::remove`] move nodes between those
/// states.
pub struct FreeTree {
    root: Link,
}

// Nodes are reachable only through the root link, so handing the tree to
// another thread hands over the whole structure.
unsafe impl Send for FreeTree {}

impl Default for FreeTree {
    fn default() -> Self {
        FreeTree::new()
    }
}

impl FreeTree {
    pub const fn new() -> Self {
        FreeTree { root: None }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Write a fresh node record into `payload` and insert it.
    ///
    /// # Safety
    ///
    /// `payload` must be the payload of a free block of total size `size`
    /// (matching its boundary tags), with at least `size_of::<FreeNode>()`
    /// writable bytes, and must not already be in the tree.
    pub(crate) unsafe fn insert(&mut self, payload: NonNull<u8>, size: usize) {
        let ptr: NonNull<FreeNode> = payload.cast();
        ptr.as_ptr().write(FreeNode::new(size));
        self.root = Some(insert_at(self.root, NodeRef(ptr)));
    }

    /// Remove `node` from the tree. The node must currently be in the tree.
    ///
    /// # Safety
    ///
    /// `node` must have been inserted and not yet removed; its record must be
    /// intact.
    pub(crate) unsafe fn remove(&mut self, node: NodeRef) {
        self.root = remove_at(self.root, node);
    }

    /// Smallest node with `size() >= size`, without removing it.
    pub(crate) unsafe fn best_fit(&self, size: usize) -> Option<NodeRef> {
        best_fit_at(self.root, size)
    }

    /// Smallest node with `size() >= size`, removed from the tree.
    pub(crate) unsafe fn pop_best_fit(&mut self, size: usize) -> Option<NodeRef> {
        let best = self.best_fit(size)?;
        self.root = remove_at(self.root, best);
        Some(best)
    }

    /// Whether `node` (by identity) is in the tree. Key descent, so this is
    /// logarithmic, not a full walk.
    pub(crate) unsafe fn contains(&self, node: NodeRef) -> bool {
        let mut current = self.root;
        while let Some(c) = current {
            match cmp(node, c) {
                Ordering::Equal => return true,
                Ordering::Less => current = c.left(),
                Ordering::Greater => current = c.right(),
            }
        }
        false
    }

    /// Walk the whole tree, counting nodes and checking the search-tree and
    /// balance invariants.
    pub fn stats(&self) -> (TreeValidity, TreeStats) {
        let mut validity = TreeValidity::default();
        let mut stats = TreeStats::default();
        let mut last: Option<(usize, usize)> = None;

        stats.height = unsafe { check(self.root, &mut validity, &mut stats, &mut last) };
        (validity, stats)
    }
}

/// Recursive in-order validity walk; returns the observed subtree height.
unsafe fn check(
    link: Link,
    validity: &mut TreeValidity,
    stats: &mut TreeStats,
    last: &mut Option<(usize, usize)>,
) -> usize {
    let n = match link {
        None => return 0,
        Some(n) => n,
    };

    let left_height = check(n.left(), validity, stats, last);

    let key = (n.size(), n.addr());
    if let Some(prev) = *last {
        if prev >= key {
            validity.out_of_order += 1;
        }
    }
    *last = Some(key);
    stats.nodes += 1;
    stats.free_bytes += n.size();

    let right_height = check(n.right(), validity, stats, last);

    let observed = 1 + max(left_height, right_height);
    if n.height() != observed {
        validity.bad_heights += 1;
    }
    if (right_height as isize - left_height as isize).abs() > 1 {
        validity.unbalanced += 1;
    }

    observed
}

/// Invalid states found in a [`FreeTree`] walk. All zero means healthy.
#[derive(Default, Debug)]
pub struct TreeValidity {
    /// Nodes whose in-order position violates the `(size, address)` order.
    pub out_of_order: usize,
    /// Nodes whose cached height disagrees with the observed subtree height.
    pub bad_heights: usize,
    /// Nodes whose subtrees differ in height by more than one.
    pub unbalanced: usize,
}

impl TreeValidity {
    pub fn is_valid(&self) -> bool {
        self.out_of_order == 0 && self.bad_heights == 0 && self.unbalanced == 0
    }
}

#[derive(Default, Debug)]
pub struct TreeStats {
    pub nodes: usize,
    pub free_bytes: usize,
    pub height: usize,
}

impl fmt::Display for FreeTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeTree(")?;
        let mut first = true;
        unsafe { fmt_in_order(self.root, f, &mut first)? };
        write!(f, ")")
    }
}

unsafe fn fmt_in_order(
    link: Link,
    f: &mut fmt::Formatter<'_>,
    first: &mut bool,
) -> fmt::Result {
    let n = match link {
        None => return Ok(()),
        Some(n) => n,
    };
    fmt_in_order(n.left(), f, first)?;
    if !*first {
        write!(f, ", ")?;
    }
    *first = false;
    write!(f, "{}@{:?}", n.size(), n.0.as_ptr())?;
    fmt_in_order(n.right(), f, first)
}
