use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use num_bigint::BigUint;
use parking_lot::RwLock;

use super::node::{Node, NodeId};
use crate::info_hash::InfoHash;

/// Bucket capacity (Kademlia's k).
pub const MAX_NODES: usize = 8;

/// A binary trie of node buckets partitioning the 160-bit id space.
///
/// The tree is immutable and `Arc`-shared: every mutation builds a new
/// tree reusing untouched branches and swaps it into the root cell.
/// Readers clone the root `Arc` and iterate a consistent snapshot while
/// writers proceed.
#[derive(Debug)]
enum Tree {
    Bucket(Bucket),
    Split(Split),
}

/// A leaf holding the nodes whose ids fall in `[from, until)`, in
/// insertion order.
#[derive(Debug, Clone)]
struct Bucket {
    from: BigUint,
    until: BigUint,
    nodes: Vec<Node>,
}

#[derive(Debug)]
struct Split {
    center: BigUint,
    lower: Arc<Tree>,
    higher: Arc<Tree>,
}

impl Bucket {
    fn covers(&self, key: &BigUint) -> bool {
        &self.from <= key && key < &self.until
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    fn good_nodes(&self) -> Vec<Node> {
        self.nodes.iter().filter(|n| n.is_good).cloned().collect()
    }
}

/// The DHT routing table plus the infohash→peers index.
pub struct RoutingTable {
    self_id: NodeId,
    self_key: BigUint,
    root: RwLock<Arc<Tree>>,
    peers: RwLock<HashMap<InfoHash, HashSet<SocketAddr>>>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId) -> Self {
        let root = Tree::Bucket(Bucket {
            from: BigUint::from(0u8),
            until: BigUint::from(1u8) << 160,
            nodes: Vec::new(),
        });
        Self {
            self_id,
            self_key: self_id.to_uint(),
            root: RwLock::new(Arc::new(root)),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Adds or refreshes a node.
    ///
    /// A known id keeps its bucket position but gets the new address and
    /// a good mark. A full bucket splits while it covers our own id;
    /// otherwise one bad node is evicted for the newcomer, or the
    /// newcomer is dropped.
    pub fn insert(&self, node: Node) {
        if node.id == self.self_id {
            return;
        }
        let mut root = self.root.write();
        let updated = insert_rec(&root, node, &self.self_key);
        *root = updated;
    }

    /// Removes a node; sibling pairs left with an empty half merge back
    /// into a single bucket.
    pub fn remove(&self, id: &NodeId) {
        let key = id.to_uint();
        let mut root = self.root.write();
        let updated = remove_rec(&root, id, &key);
        *root = updated;
    }

    /// The good nodes of the bucket covering `target`.
    pub fn find_bucket(&self, target: &NodeId) -> Vec<Node> {
        let key = target.to_uint();
        let mut tree = self.snapshot();
        loop {
            match &*tree {
                Tree::Bucket(bucket) => return bucket.good_nodes(),
                Tree::Split(split) => {
                    let next = if key < split.center {
                        split.lower.clone()
                    } else {
                        split.higher.clone()
                    };
                    tree = next;
                }
            }
        }
    }

    /// All good nodes, lazily, buckets nearest `target` first.
    pub fn find_nodes(&self, target: &NodeId) -> FindNodes {
        FindNodes {
            target: target.to_uint(),
            stack: vec![self.snapshot()],
            current: Vec::new().into_iter(),
        }
    }

    /// Marks nodes in `good` as responsive and nodes in `bad` as not,
    /// in one pass over the tree.
    pub fn update_goodness(&self, good: &[NodeId], bad: &[NodeId]) {
        if good.is_empty() && bad.is_empty() {
            return;
        }
        let good: HashSet<NodeId> = good.iter().copied().collect();
        let bad: HashSet<NodeId> = bad.iter().copied().collect();
        let mut root = self.root.write();
        let updated = relabel(&root, &good, &bad);
        *root = updated;
    }

    pub fn add_peer(&self, info_hash: InfoHash, peer: SocketAddr) {
        self.peers.write().entry(info_hash).or_default().insert(peer);
    }

    pub fn find_peers(&self, info_hash: &InfoHash) -> Option<HashSet<SocketAddr>> {
        self.peers.read().get(info_hash).cloned()
    }

    /// Every known node, good or bad, for callers that snapshot the
    /// table across restarts.
    pub fn all_nodes(&self) -> Vec<Node> {
        let mut nodes = Vec::new();
        collect_nodes(&self.snapshot(), &mut nodes);
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.all_nodes().len()
    }

    fn snapshot(&self) -> Arc<Tree> {
        self.root.read().clone()
    }

    /// Leaf ranges in ascending order, for partition checks.
    #[cfg(test)]
    pub(crate) fn bucket_ranges(&self) -> Vec<(BigUint, BigUint)> {
        fn walk(tree: &Tree, out: &mut Vec<(BigUint, BigUint)>) {
            match tree {
                Tree::Bucket(b) => out.push((b.from.clone(), b.until.clone())),
                Tree::Split(s) => {
                    walk(&s.lower, out);
                    walk(&s.higher, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.snapshot(), &mut out);
        out
    }

    /// Node ids per leaf, in tree order, for split-shape checks.
    #[cfg(test)]
    pub(crate) fn bucket_sizes(&self) -> Vec<usize> {
        fn walk(tree: &Tree, out: &mut Vec<usize>) {
            match tree {
                Tree::Bucket(b) => out.push(b.nodes.len()),
                Tree::Split(s) => {
                    walk(&s.lower, out);
                    walk(&s.higher, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.snapshot(), &mut out);
        out
    }
}

fn insert_rec(tree: &Arc<Tree>, node: Node, self_key: &BigUint) -> Arc<Tree> {
    match &**tree {
        Tree::Split(split) => {
            let key = node.id.to_uint();
            let (lower, higher) = if key < split.center {
                (insert_rec(&split.lower, node, self_key), split.higher.clone())
            } else {
                (split.lower.clone(), insert_rec(&split.higher, node, self_key))
            };
            Arc::new(Tree::Split(Split {
                center: split.center.clone(),
                lower,
                higher,
            }))
        }
        Tree::Bucket(bucket) => {
            if let Some(pos) = bucket.position(&node.id) {
                let mut updated = bucket.clone();
                updated.nodes[pos] = Node {
                    is_good: true,
                    ..node
                };
                return Arc::new(Tree::Bucket(updated));
            }
            if bucket.nodes.len() < MAX_NODES {
                let mut updated = bucket.clone();
                updated.nodes.push(Node {
                    is_good: true,
                    ..node
                });
                return Arc::new(Tree::Bucket(updated));
            }
            if bucket.covers(self_key) {
                // Splitting may leave the target half full again; recurse
                // until the newcomer fits.
                let split = Arc::new(split_bucket(bucket));
                return insert_rec(&split, node, self_key);
            }
            if let Some(pos) = bucket.nodes.iter().position(|n| !n.is_good) {
                let mut updated = bucket.clone();
                updated.nodes.remove(pos);
                updated.nodes.push(Node {
                    is_good: true,
                    ..node
                });
                return Arc::new(Tree::Bucket(updated));
            }
            // Full of good nodes outside our own range: drop the newcomer.
            tree.clone()
        }
    }
}

fn split_bucket(bucket: &Bucket) -> Tree {
    let center: BigUint = (&bucket.from + &bucket.until) >> 1;
    let (lower_nodes, higher_nodes): (Vec<Node>, Vec<Node>) = bucket
        .nodes
        .iter()
        .cloned()
        .partition(|n| n.id.to_uint() < center);

    Tree::Split(Split {
        lower: Arc::new(Tree::Bucket(Bucket {
            from: bucket.from.clone(),
            until: center.clone(),
            nodes: lower_nodes,
        })),
        higher: Arc::new(Tree::Bucket(Bucket {
            from: center.clone(),
            until: bucket.until.clone(),
            nodes: higher_nodes,
        })),
        center,
    })
}

fn remove_rec(tree: &Arc<Tree>, id: &NodeId, key: &BigUint) -> Arc<Tree> {
    match &**tree {
        Tree::Bucket(bucket) => match bucket.position(id) {
            Some(pos) => {
                let mut updated = bucket.clone();
                updated.nodes.remove(pos);
                Arc::new(Tree::Bucket(updated))
            }
            None => tree.clone(),
        },
        Tree::Split(split) => {
            let (lower, higher) = if key < &split.center {
                (remove_rec(&split.lower, id, key), split.higher.clone())
            } else {
                (split.lower.clone(), remove_rec(&split.higher, id, key))
            };
            merge_empty_sibling(split.center.clone(), lower, higher)
        }
    }
}

/// Collapses a split whose children are buckets with one of them empty
/// into a single bucket spanning the whole range.
fn merge_empty_sibling(center: BigUint, lower: Arc<Tree>, higher: Arc<Tree>) -> Arc<Tree> {
    if let (Tree::Bucket(a), Tree::Bucket(b)) = (&*lower, &*higher) {
        if a.nodes.is_empty() || b.nodes.is_empty() {
            let survivor = if a.nodes.is_empty() { b } else { a };
            return Arc::new(Tree::Bucket(Bucket {
                from: a.from.clone(),
                until: b.until.clone(),
                nodes: survivor.nodes.clone(),
            }));
        }
    }
    Arc::new(Tree::Split(Split {
        center,
        lower,
        higher,
    }))
}

fn relabel(tree: &Tree, good: &HashSet<NodeId>, bad: &HashSet<NodeId>) -> Arc<Tree> {
    match tree {
        Tree::Bucket(bucket) => {
            let mut updated = bucket.clone();
            for node in &mut updated.nodes {
                if good.contains(&node.id) {
                    node.is_good = true;
                } else if bad.contains(&node.id) {
                    node.is_good = false;
                }
            }
            Arc::new(Tree::Bucket(updated))
        }
        Tree::Split(split) => Arc::new(Tree::Split(Split {
            center: split.center.clone(),
            lower: relabel(&split.lower, good, bad),
            higher: relabel(&split.higher, good, bad),
        })),
    }
}

fn collect_nodes(tree: &Tree, out: &mut Vec<Node>) {
    match tree {
        Tree::Bucket(bucket) => out.extend(bucket.nodes.iter().cloned()),
        Tree::Split(split) => {
            collect_nodes(&split.lower, out);
            collect_nodes(&split.higher, out);
        }
    }
}

/// Lazy walk over a table snapshot, yielding good nodes bucket by
/// bucket; at every split the half covering the target is drained
/// before its sibling.
pub struct FindNodes {
    target: BigUint,
    stack: Vec<Arc<Tree>>,
    current: std::vec::IntoIter<Node>,
}

impl Iterator for FindNodes {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        loop {
            if let Some(node) = self.current.next() {
                return Some(node);
            }
            match &*self.stack.pop()? {
                Tree::Bucket(bucket) => {
                    self.current = bucket.good_nodes().into_iter();
                }
                Tree::Split(split) => {
                    // Popped last-in-first-out: push the far half first.
                    if self.target < split.center {
                        self.stack.push(split.higher.clone());
                        self.stack.push(split.lower.clone());
                    } else {
                        self.stack.push(split.lower.clone());
                        self.stack.push(split.higher.clone());
                    }
                }
            }
        }
    }
}
