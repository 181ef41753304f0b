/// In-memory revision tree representation.
///
/// A document's revision tree is a forest of `RevPath`s: each root is a
/// `(pos, RevNode)` pair and every `RevNode` has at most one parent
/// (enforced by construction, not stored explicitly — traversal always
/// starts from a root). This is the representation used by adapters that
/// keep the whole tree resident (the memory adapter); the sqlite adapter
/// stores the same logical tree as rows and never materializes this type.
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevStatus {
    Available,
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeOpts {
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct RevNode {
    pub hash: String,
    pub status: RevStatus,
    pub opts: NodeOpts,
    pub children: Vec<RevNode>,
}

#[derive(Debug, Clone)]
pub struct RevPath {
    pub pos: u64,
    pub tree: RevNode,
}

pub type RevTree = Vec<RevPath>;

/// A leaf revision together with its generation and deletion state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    pub pos: u64,
    pub hash: String,
    pub deleted: bool,
}

/// Collect every leaf (node with no children) across all paths in the tree,
/// sorted with the winning revision first: non-deleted before deleted,
/// higher generation before lower, lexicographically greater hash breaks
/// ties. This ordering is what `merge::winning_rev` and
/// `merge::collect_conflicts` rely on.
pub fn collect_leaves(tree: &RevTree) -> Vec<LeafInfo> {
    let mut leaves = Vec::new();
    for path in tree {
        walk(&path.tree, path.pos, &mut leaves);
    }
    leaves.sort_by(|a, b| {
        a.deleted
            .cmp(&b.deleted)
            .then_with(|| b.pos.cmp(&a.pos))
            .then_with(|| b.hash.cmp(&a.hash))
    });
    leaves
}

fn walk(node: &RevNode, pos: u64, leaves: &mut Vec<LeafInfo>) {
    if node.children.is_empty() {
        leaves.push(LeafInfo {
            pos,
            hash: node.hash.clone(),
            deleted: node.opts.deleted,
        });
        return;
    }
    for child in &node.children {
        walk(child, pos + 1, leaves);
    }
}

/// Build a linear `RevPath` from a revision history, newest-first (as
/// returned by CouchDB's `_revisions.ids`): `hashes[0]` is the leaf at
/// generation `pos`, `hashes.last()` is the root ancestor. `opts` is
/// applied to the leaf node only (it is the only node whose `deleted` flag
/// a single `forceInsert` call can set meaningfully).
pub fn build_path_from_revs(
    pos: u64,
    hashes: &[String],
    opts: NodeOpts,
    status: RevStatus,
) -> RevPath {
    assert!(!hashes.is_empty(), "revision history must not be empty");
    let root_pos = pos - (hashes.len() as u64 - 1);

    let mut rev_iter = hashes.iter().rev();
    let root_hash = rev_iter.next().expect("non-empty").clone();
    let mut root = RevNode {
        hash: root_hash,
        status,
        opts: NodeOpts::default(),
        children: Vec::new(),
    };

    {
        let mut current = &mut root;
        for hash in rev_iter {
            current.children.push(RevNode {
                hash: hash.clone(),
                status,
                opts: NodeOpts::default(),
                children: Vec::new(),
            });
            current = current.children.last_mut().expect("just pushed");
        }
        current.opts = opts;
    }

    RevPath { pos: root_pos, tree: root }
}

/// Find a node in the tree by `(pos, hash)`, returning its `opts`/`status`
/// if present. Used by `forceInsert`'s common-ancestor search.
pub fn find_node(tree: &RevTree, pos: u64, hash: &str) -> Option<&RevNode> {
    for path in tree {
        if let Some(n) = find_in(&path.tree, path.pos, pos, hash) {
            return Some(n);
        }
    }
    None
}

fn find_in<'a>(node: &'a RevNode, current_pos: u64, pos: u64, hash: &str) -> Option<&'a RevNode> {
    if current_pos == pos && node.hash == hash {
        return Some(node);
    }
    for child in &node.children {
        if let Some(n) = find_in(child, current_pos + 1, pos, hash) {
            return Some(n);
        }
    }
    None
}

/// Walk from a given `(pos, hash)` back to the root of its branch, returning
/// the hashes newest-first (`result[0] == hash`, `result.last()` is the
/// branch's root ancestor). Used to populate `Document::revisions` /
/// `_revisions.ids` for `GetOptions::revs` and `bulk_get`.
pub fn ancestor_chain(tree: &RevTree, pos: u64, hash: &str) -> Vec<String> {
    for path in tree {
        if let Some(mut chain) = collect_ancestors(&path.tree, path.pos, pos, hash) {
            chain.reverse();
            return chain;
        }
    }
    Vec::new()
}

/// Returns the chain from root to `target`, oldest-first, if found under `node`.
fn collect_ancestors(
    node: &RevNode,
    current_pos: u64,
    target_pos: u64,
    target_hash: &str,
) -> Option<Vec<String>> {
    if current_pos == target_pos && node.hash == target_hash {
        return Some(vec![node.hash.clone()]);
    }
    for child in &node.children {
        if let Some(mut chain) = collect_ancestors(child, current_pos + 1, target_pos, target_hash) {
            chain.insert(0, node.hash.clone());
            return Some(chain);
        }
    }
    None
}

/// Flatten every `(pos, hash)` pair reachable in the tree into a lookup
/// table, used by replication to answer `_revs_diff` queries cheaply.
pub fn all_revisions(tree: &RevTree) -> HashMap<u64, Vec<String>> {
    let mut out: HashMap<u64, Vec<String>> = HashMap::new();
    for path in tree {
        collect_all(&path.tree, path.pos, &mut out);
    }
    out
}

fn collect_all(node: &RevNode, pos: u64, out: &mut HashMap<u64, Vec<String>>) {
    out.entry(pos).or_default().push(node.hash.clone());
    for child in &node.children {
        collect_all(child, pos + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_path_single_node() {
        let path = build_path_from_revs(1, &["a".into()], NodeOpts::default(), RevStatus::Available);
        assert_eq!(path.pos, 1);
        assert_eq!(path.tree.hash, "a");
        assert!(path.tree.children.is_empty());
    }

    #[test]
    fn build_path_chain() {
        let path = build_path_from_revs(
            3,
            &["c".into(), "b".into(), "a".into()],
            NodeOpts::default(),
            RevStatus::Available,
        );
        assert_eq!(path.pos, 1);
        assert_eq!(path.tree.hash, "a");
        assert_eq!(path.tree.children[0].hash, "b");
        assert_eq!(path.tree.children[0].children[0].hash, "c");
    }

    #[test]
    fn find_node_locates_internal() {
        let path = build_path_from_revs(
            3,
            &["c".into(), "b".into(), "a".into()],
            NodeOpts::default(),
            RevStatus::Available,
        );
        let tree = vec![path];
        assert!(find_node(&tree, 2, "b").is_some());
        assert!(find_node(&tree, 2, "zzz").is_none());
    }

    #[test]
    fn ancestor_chain_is_newest_first() {
        let path = build_path_from_revs(
            3,
            &["c".into(), "b".into(), "a".into()],
            NodeOpts::default(),
            RevStatus::Available,
        );
        let tree = vec![path];
        assert_eq!(ancestor_chain(&tree, 3, "c"), vec!["c", "b", "a"]);
        assert_eq!(ancestor_chain(&tree, 2, "b"), vec!["b", "a"]);
        assert!(ancestor_chain(&tree, 9, "zzz").is_empty());
    }

    #[test]
    fn all_revisions_flattens_chain() {
        let path = build_path_from_revs(
            2,
            &["b".into(), "a".into()],
            NodeOpts::default(),
            RevStatus::Available,
        );
        let revs = all_revisions(&vec![path]);
        assert_eq!(revs[&1], vec!["a".to_string()]);
        assert_eq!(revs[&2], vec!["b".to_string()]);
    }
}
