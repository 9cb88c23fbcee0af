//! Revision tree
//!
//! Every document owns a forest of revision paths. Each path starts at a
//! root generation (`pos`) and branches wherever conflicting edits were
//! grafted. Stemmed or compacted revisions stay in the tree as `missing`
//! nodes so ancestry can still be resolved.
//!
//! Winner selection is deterministic:
//! 1. non-deleted leaves beat deleted leaves
//! 2. higher generation wins
//! 3. lexicographically greater hash breaks ties

use crate::revision::RevId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Whether a revision still has a stored body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevStatus {
    #[default]
    Available,
    Missing,
}

/// One node of the revision tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevNode {
    pub hash: String,
    #[serde(default)]
    pub status: RevStatus,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RevNode>,
}

impl RevNode {
    pub fn new(hash: impl Into<String>, status: RevStatus, deleted: bool) -> Self {
        Self {
            hash: hash.into(),
            status,
            deleted,
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A rooted subtree whose root sits at generation `pos`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevPath {
    pub pos: u64,
    pub root: RevNode,
}

/// One revision in a linear history, used to build [`RevPath`] chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub hash: String,
    pub status: RevStatus,
    pub deleted: bool,
}

impl RevPath {
    /// Build a single-branch path from `start` generation, oldest link first.
    /// Returns `None` for an empty chain.
    pub fn linear(start: u64, links: Vec<ChainLink>) -> Option<Self> {
        let mut iter = links.into_iter().rev();
        let last = iter.next()?;
        let mut node = RevNode::new(last.hash, last.status, last.deleted);
        for link in iter {
            let mut parent = RevNode::new(link.hash, link.status, link.deleted);
            parent.children.push(node);
            node = parent;
        }
        Some(Self { pos: start, root: node })
    }

    /// Flatten a path that is expected to be linear (first child is followed).
    fn into_chain(self) -> (u64, Vec<ChainLink>) {
        let mut links = Vec::new();
        let mut node = Some(self.root);
        while let Some(mut n) = node {
            let next = if n.children.is_empty() {
                None
            } else {
                Some(n.children.swap_remove(0))
            };
            links.push(ChainLink {
                hash: n.hash,
                status: n.status,
                deleted: n.deleted,
            });
            node = next;
        }
        (self.pos, links)
    }
}

/// How a merged path related to the existing tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The path extended an existing leaf.
    NewLeaf,
    /// The path started a new branch (off an internal node or a new root).
    NewBranch,
    /// Every revision of the path was already known.
    InternalNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub outcome: MergeOutcome,
    /// Revisions removed from the tree by stemming; their bodies must be purged.
    pub stemmed: Vec<RevId>,
}

/// A node reached during traversal
#[derive(Debug, Clone)]
pub struct NodeEntry<'a> {
    pub rev: RevId,
    pub node: &'a RevNode,
    pub is_leaf: bool,
}

/// A leaf revision with its flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub rev: RevId,
    pub deleted: bool,
    pub status: RevStatus,
}

/// Full branching history of one document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevTree {
    pub roots: Vec<RevPath>,
}

impl RevTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_path(path: RevPath) -> Self {
        Self { roots: vec![path] }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Visit every node, depth first, roots in order.
    pub fn nodes(&self) -> Vec<NodeEntry<'_>> {
        let mut out = Vec::new();
        let mut stack: Vec<(u64, &RevNode)> = self
            .roots
            .iter()
            .rev()
            .map(|p| (p.pos, &p.root))
            .collect();
        while let Some((pos, node)) = stack.pop() {
            out.push(NodeEntry {
                rev: RevId::new(pos, node.hash.clone()),
                node,
                is_leaf: node.is_leaf(),
            });
            for child in node.children.iter().rev() {
                stack.push((pos + 1, child));
            }
        }
        out
    }

    /// Every root-to-leaf history, oldest revision first.
    pub fn leaf_paths(&self) -> Vec<Vec<(RevId, &RevNode)>> {
        let mut out = Vec::new();
        let mut stack: Vec<(u64, &RevNode, Vec<(RevId, &RevNode)>)> = self
            .roots
            .iter()
            .rev()
            .map(|p| (p.pos, &p.root, Vec::new()))
            .collect();
        while let Some((pos, node, mut history)) = stack.pop() {
            history.push((RevId::new(pos, node.hash.clone()), node));
            if node.is_leaf() {
                out.push(history);
                continue;
            }
            for child in node.children.iter().rev() {
                stack.push((pos + 1, child, history.clone()));
            }
        }
        out
    }

    /// Leaves sorted in winner order (winner first).
    pub fn leaves(&self) -> Vec<Leaf> {
        let mut leaves: Vec<Leaf> = self
            .nodes()
            .into_iter()
            .filter(|e| e.is_leaf)
            .map(|e| Leaf {
                rev: e.rev,
                deleted: e.node.deleted,
                status: e.node.status,
            })
            .collect();
        leaves.sort_by(|a, b| {
            (!b.deleted, b.rev.generation, &b.rev.hash).cmp(&(!a.deleted, a.rev.generation, &a.rev.hash))
        });
        leaves
    }

    pub fn winning_rev(&self) -> Option<RevId> {
        self.leaves().into_iter().next().map(|l| l.rev)
    }

    /// Non-deleted leaves other than the winner.
    pub fn conflicts(&self) -> Vec<RevId> {
        self.leaves()
            .into_iter()
            .skip(1)
            .filter(|l| !l.deleted)
            .map(|l| l.rev)
            .collect()
    }

    pub fn node(&self, rev: &RevId) -> Option<&RevNode> {
        self.roots.iter().find_map(|p| find(&p.root, p.pos, rev))
    }

    fn node_mut(&mut self, rev: &RevId) -> Option<&mut RevNode> {
        for path in self.roots.iter_mut() {
            if let Some(found) = find_mut(&mut path.root, path.pos, rev) {
                return Some(found);
            }
        }
        None
    }

    pub fn contains(&self, rev: &RevId) -> bool {
        self.node(rev).is_some()
    }

    pub fn is_leaf(&self, rev: &RevId) -> bool {
        self.node(rev).map(RevNode::is_leaf).unwrap_or(false)
    }

    pub fn is_deleted(&self, rev: &RevId) -> bool {
        self.node(rev).map(|n| n.deleted).unwrap_or(false)
    }

    /// Resolve the leaf descending from `rev`, preferring the winner order.
    pub fn latest(&self, rev: &RevId) -> Option<RevId> {
        let paths = self.leaf_paths();
        self.leaves().into_iter().find_map(|leaf| {
            paths
                .iter()
                .filter(|p| p.last().map(|(r, _)| r == &leaf.rev).unwrap_or(false))
                .any(|p| p.iter().any(|(r, _)| r == rev))
                .then_some(leaf.rev)
        })
    }

    /// Hashes from `rev` back to the oldest known ancestor, newest first.
    pub fn ancestry(&self, rev: &RevId) -> Option<Vec<String>> {
        self.leaf_paths().into_iter().find_map(|path| {
            let idx = path.iter().position(|(r, _)| r == rev)?;
            Some(path[..=idx].iter().rev().map(|(r, _)| r.hash.clone()).collect())
        })
    }

    /// Graft `path` into the tree, then stem to `revs_limit` generations.
    pub fn merge(&mut self, path: RevPath, revs_limit: Option<u64>) -> MergeResult {
        let outcome = self.graft(path);
        let stemmed = match revs_limit {
            Some(limit) => self.stem(limit),
            None => Vec::new(),
        };
        MergeResult { outcome, stemmed }
    }

    fn graft(&mut self, path: RevPath) -> MergeOutcome {
        let (start, links) = path.into_chain();
        if links.is_empty() {
            return MergeOutcome::InternalNode;
        }
        self.reroot(start, &links);

        let deepest = (0..links.len())
            .rev()
            .find(|&i| self.contains(&RevId::new(start + i as u64, links[i].hash.clone())));

        let Some(j) = deepest else {
            if let Some(p) = RevPath::linear(start, links) {
                self.roots.push(p);
                self.roots.sort_by(|a, b| (a.pos, &a.root.hash).cmp(&(b.pos, &b.root.hash)));
            }
            return MergeOutcome::NewBranch;
        };

        let anchor_rev = RevId::new(start + j as u64, links[j].hash.clone());
        let Some(anchor) = self.node_mut(&anchor_rev) else {
            return MergeOutcome::InternalNode;
        };
        let link = &links[j];
        if link.status == RevStatus::Available && anchor.status == RevStatus::Missing {
            anchor.status = RevStatus::Available;
        }
        if j == links.len() - 1 {
            if link.status == RevStatus::Available && anchor.is_leaf() {
                anchor.deleted = link.deleted;
            }
            return MergeOutcome::InternalNode;
        }

        let was_leaf = anchor.is_leaf();
        let rest = links[j + 1..].to_vec();
        if let Some(branch) = RevPath::linear(0, rest) {
            anchor.children.push(branch.root);
            anchor.children.sort_by(|a, b| a.hash.cmp(&b.hash));
        }
        if was_leaf {
            MergeOutcome::NewLeaf
        } else {
            MergeOutcome::NewBranch
        }
    }

    /// Extend an existing root backwards when `links` carries older history for it.
    fn reroot(&mut self, start: u64, links: &[ChainLink]) {
        for root in self.roots.iter_mut() {
            if root.pos <= start {
                continue;
            }
            let k = (root.pos - start) as usize;
            if k >= links.len() || links[k].hash != root.root.hash {
                continue;
            }
            let mut node = std::mem::replace(&mut root.root, RevNode::new("", RevStatus::Missing, false));
            for link in links[..k].iter().rev() {
                let mut parent = RevNode::new(link.hash.clone(), RevStatus::Missing, link.deleted);
                parent.children.push(node);
                node = parent;
            }
            *root = RevPath { pos: start, root: node };
            break;
        }
    }

    /// Keep at most `limit` generations above every leaf; returns removed revisions.
    pub fn stem(&mut self, limit: u64) -> Vec<RevId> {
        let limit = limit.max(1) as usize;
        let mut kept: HashSet<RevId> = HashSet::new();
        let mut over_limit = false;
        for path in self.leaf_paths() {
            if path.len() > limit {
                over_limit = true;
            }
            let from = path.len().saturating_sub(limit);
            kept.extend(path[from..].iter().map(|(r, _)| r.clone()));
        }
        if !over_limit {
            return Vec::new();
        }

        let mut stemmed = Vec::new();
        let mut roots = Vec::new();
        for path in std::mem::take(&mut self.roots) {
            if let Some(root) = prune(path.root, path.pos, &kept, &mut stemmed, &mut roots) {
                roots.push(RevPath { pos: path.pos, root });
            }
        }
        roots.sort_by(|a, b| (a.pos, &a.root.hash).cmp(&(b.pos, &b.root.hash)));
        self.roots = roots;
        stemmed
    }

    /// Mark every non-leaf revision that still has a body as missing.
    pub fn compact(&mut self) -> Vec<RevId> {
        let revs: Vec<RevId> = self
            .nodes()
            .into_iter()
            .filter(|e| !e.is_leaf && e.node.status == RevStatus::Available)
            .map(|e| e.rev)
            .collect();
        self.mark_missing(&revs);
        revs
    }

    /// Mark the given revisions missing, keeping the tree shape.
    pub fn mark_missing(&mut self, revs: &[RevId]) -> usize {
        let mut marked = 0;
        for rev in revs {
            if let Some(node) = self.node_mut(rev) {
                node.status = RevStatus::Missing;
                marked += 1;
            }
        }
        marked
    }
}

fn find<'a>(node: &'a RevNode, pos: u64, rev: &RevId) -> Option<&'a RevNode> {
    if pos == rev.generation {
        return (node.hash == rev.hash).then_some(node);
    }
    if pos > rev.generation {
        return None;
    }
    node.children.iter().find_map(|c| find(c, pos + 1, rev))
}

fn find_mut<'a>(node: &'a mut RevNode, pos: u64, rev: &RevId) -> Option<&'a mut RevNode> {
    if pos == rev.generation {
        return if node.hash == rev.hash { Some(node) } else { None };
    }
    if pos > rev.generation {
        return None;
    }
    for child in node.children.iter_mut() {
        if let Some(found) = find_mut(child, pos + 1, rev) {
            return Some(found);
        }
    }
    None
}

fn prune(
    mut node: RevNode,
    pos: u64,
    kept: &HashSet<RevId>,
    stemmed: &mut Vec<RevId>,
    new_roots: &mut Vec<RevPath>,
) -> Option<RevNode> {
    let rev = RevId::new(pos, node.hash.clone());
    let children = std::mem::take(&mut node.children);
    if kept.contains(&rev) {
        node.children = children
            .into_iter()
            .filter_map(|c| prune(c, pos + 1, kept, stemmed, new_roots))
            .collect();
        return Some(node);
    }
    stemmed.push(rev);
    for child in children {
        if let Some(c) = prune(child, pos + 1, kept, stemmed, new_roots) {
            new_roots.push(RevPath { pos: pos + 1, root: c });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn link(hash: &str) -> ChainLink {
        ChainLink {
            hash: hash.to_string(),
            status: RevStatus::Available,
            deleted: false,
        }
    }

    fn chain(start: u64, hashes: &[&str]) -> RevPath {
        RevPath::linear(start, hashes.iter().map(|h| link(h)).collect()).unwrap()
    }

    fn rev(s: &str) -> RevId {
        s.parse().unwrap()
    }

    #[test]
    fn test_extend_leaf_is_new_leaf() {
        let mut tree = RevTree::from_path(chain(1, &["a"]));
        let res = tree.merge(chain(1, &["a", "b"]), None);
        assert_eq!(res.outcome, MergeOutcome::NewLeaf);
        assert_eq!(tree.winning_rev(), Some(rev("2-b")));
        assert!(!tree.is_leaf(&rev("1-a")));
    }

    #[test]
    fn test_branch_from_internal_node() {
        let mut tree = RevTree::from_path(chain(1, &["a", "b"]));
        let res = tree.merge(chain(1, &["a", "c"]), None);
        assert_eq!(res.outcome, MergeOutcome::NewBranch);
        assert_eq!(tree.winning_rev(), Some(rev("2-c")));
        assert_eq!(tree.conflicts(), vec![rev("2-b")]);
    }

    #[test]
    fn test_existing_path_is_internal_node() {
        let mut tree = RevTree::from_path(chain(1, &["a", "b"]));
        let res = tree.merge(chain(1, &["a", "b"]), None);
        assert_eq!(res.outcome, MergeOutcome::InternalNode);
        assert_eq!(tree.nodes().len(), 2);
    }

    #[test]
    fn test_unrelated_root_is_new_branch() {
        let mut tree = RevTree::from_path(chain(1, &["a"]));
        let res = tree.merge(chain(1, &["z"]), None);
        assert_eq!(res.outcome, MergeOutcome::NewBranch);
        assert_eq!(tree.roots.len(), 2);
        assert_eq!(tree.winning_rev(), Some(rev("1-z")));
    }

    #[test]
    fn test_deleted_leaf_loses_to_shorter_live_leaf() {
        let mut tree = RevTree::from_path(chain(1, &["a", "b"]));
        let mut deleted = chain(1, &["a", "b", "c"]);
        deleted.root.children[0].children[0].deleted = true;
        tree.merge(deleted, None);
        tree.merge(chain(1, &["a", "x"]), None);
        assert_eq!(tree.winning_rev(), Some(rev("2-x")));
        assert!(tree.conflicts().is_empty());
    }

    #[test]
    fn test_all_leaves_deleted_picks_deepest() {
        let mut path = chain(1, &["a", "b"]);
        path.root.children[0].deleted = true;
        let mut tree = RevTree::from_path(path);
        let mut other = chain(1, &["a", "c", "d"]);
        other.root.children[0].children[0].deleted = true;
        tree.merge(other, None);
        assert_eq!(tree.winning_rev(), Some(rev("3-d")));
        assert!(tree.is_deleted(&rev("3-d")));
    }

    #[test]
    fn test_stem_removes_old_generations() {
        let mut tree = RevTree::from_path(chain(1, &["a", "b", "c", "d"]));
        let stemmed = tree.stem(2);
        assert_eq!(stemmed, vec![rev("1-a"), rev("2-b")]);
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.roots[0].pos, 3);
        assert_eq!(tree.winning_rev(), Some(rev("4-d")));
    }

    #[test]
    fn test_stem_keeps_shared_ancestor_of_short_branch() {
        let mut tree = RevTree::from_path(chain(1, &["a", "b", "c", "d"]));
        tree.merge(chain(1, &["a", "x"]), None);
        let stemmed = tree.stem(2);
        // 1-a is within two generations of leaf 2-x, so it survives.
        assert_eq!(stemmed, vec![rev("2-b")]);
        assert!(tree.contains(&rev("1-a")));
        assert!(tree.contains(&rev("3-c")));
        assert_eq!(tree.roots.len(), 2);
    }

    #[test]
    fn test_merge_reroots_with_older_history() {
        let mut tree = RevTree::from_path(chain(3, &["c", "d"]));
        let res = tree.merge(chain(1, &["a", "b", "c", "d", "e"]), None);
        assert_eq!(res.outcome, MergeOutcome::NewLeaf);
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.roots[0].pos, 1);
        assert_eq!(tree.node(&rev("1-a")).unwrap().status, RevStatus::Missing);
        assert_eq!(tree.winning_rev(), Some(rev("5-e")));
    }

    #[test]
    fn test_compact_marks_internal_nodes_missing() {
        let mut tree = RevTree::from_path(chain(1, &["a", "b", "c"]));
        let revs = tree.compact();
        assert_eq!(revs, vec![rev("1-a"), rev("2-b")]);
        assert_eq!(tree.node(&rev("1-a")).unwrap().status, RevStatus::Missing);
        assert_eq!(tree.node(&rev("3-c")).unwrap().status, RevStatus::Available);
        assert!(tree.compact().is_empty());
    }

    #[test]
    fn test_latest_and_ancestry() {
        let mut tree = RevTree::from_path(chain(1, &["a", "b", "c"]));
        tree.merge(chain(1, &["a", "x"]), None);
        assert_eq!(tree.latest(&rev("2-b")), Some(rev("3-c")));
        assert_eq!(tree.latest(&rev("2-x")), Some(rev("2-x")));
        assert_eq!(tree.latest(&rev("9-nope")), None);
        assert_eq!(
            tree.ancestry(&rev("3-c")).unwrap(),
            vec!["c".to_string(), "b".to_string(), "a".to_string()]
        );
    }

    #[test]
    fn test_serde_shape() {
        let tree = RevTree::from_path(chain(1, &["a", "b"]));
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json[0]["pos"], 1);
        assert_eq!(json[0]["root"]["hash"], "a");
        let back: RevTree = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree);
    }

    proptest! {
        #[test]
        fn prop_winner_independent_of_graft_order(
            branches in proptest::collection::vec(("[a-f]{1,3}", 1usize..5, any::<bool>()), 1..6)
        ) {
            let paths: Vec<RevPath> = branches
                .iter()
                .enumerate()
                .map(|(i, (tag, len, deleted))| {
                    let mut links: Vec<ChainLink> = vec![link("root")];
                    for n in 0..*len {
                        links.push(link(&format!("{}{}{}", tag, i, n)));
                    }
                    if let Some(last) = links.last_mut() {
                        last.deleted = *deleted;
                    }
                    RevPath::linear(1, links).unwrap()
                })
                .collect();

            let mut forward = RevTree::new();
            for p in paths.iter().cloned() {
                forward.merge(p, None);
            }
            let mut backward = RevTree::new();
            for p in paths.iter().rev().cloned() {
                backward.merge(p, None);
            }
            prop_assert_eq!(forward.winning_rev(), backward.winning_rev());

            let winner = forward.winning_rev().unwrap();
            for leaf in forward.leaves() {
                let w_deleted = forward.is_deleted(&winner);
                prop_assert!(
                    (!w_deleted, winner.generation, &winner.hash)
                        >= (!leaf.deleted, leaf.rev.generation, &leaf.rev.hash)
                );
            }
        }

        #[test]
        fn prop_stem_bounds_every_leaf_path(len in 1usize..30, limit in 1u64..10) {
            let hashes: Vec<String> = (0..len).map(|i| format!("h{}", i)).collect();
            let links = hashes.iter().map(|h| link(h)).collect();
            let mut tree = RevTree::from_path(RevPath::linear(1, links).unwrap());
            let winner = tree.winning_rev();
            let stemmed = tree.stem(limit);
            prop_assert_eq!(tree.winning_rev(), winner);
            prop_assert_eq!(stemmed.len(), len.saturating_sub(limit as usize));
            for path in tree.leaf_paths() {
                prop_assert!(path.len() as u64 <= limit);
            }
        }
    }
}
