//! Selective sync
//!
//! The folder-selection tree is an arena of [`FolderNode`]s addressed by
//! [`NodeId`]; parents and children refer to each other by index, so
//! tri-state recomputation is a walk over indices.
//!
//! Invariant: a node with children always holds the aggregate of its
//! children's states (`Selected` iff all selected, `Deselected` iff all
//! deselected, otherwise `Partial`). Leaves are never `Partial`.
//!
//! The manager keeps the tree behind a single `RwLock`, so one mutation
//! runs at a time and readers always see a consistent tree.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use cloudsync_core::domain::{SelectionChange, SelectionState, SyncError, SyncPath};
use cloudsync_core::ports::{ICloudApi, IStateRepository};

use crate::events::EventHub;
use crate::storage_error;

// ============================================================================
// Arena tree
// ============================================================================

/// Stable index of a node in a [`FolderTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// One file or folder of the remote tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderNode {
    path: SyncPath,
    state: SelectionState,
    /// Own size: file length for files, 0 for folders
    size_bytes: u64,
    is_directory: bool,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl FolderNode {
    pub fn path(&self) -> &SyncPath {
        &self.path
    }

    pub fn state(&self) -> SelectionState {
        self.state
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Rooted, acyclic selection tree
#[derive(Debug, Clone)]
pub struct FolderTree {
    nodes: Vec<Option<FolderNode>>,
    index: HashMap<SyncPath, NodeId>,
}

impl Default for FolderTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderTree {
    /// A tree holding only the selected root
    pub fn new() -> Self {
        let root = FolderNode {
            path: SyncPath::root(),
            state: SelectionState::Selected,
            size_bytes: 0,
            is_directory: true,
            parent: None,
            children: Vec::new(),
        };
        let mut index = HashMap::new();
        index.insert(SyncPath::root(), NodeId(0));
        Self {
            nodes: vec![Some(root)],
            index,
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn id_of(&self, path: &SyncPath) -> Option<NodeId> {
        self.index.get(path).copied()
    }

    pub fn node(&self, id: NodeId) -> Option<&FolderNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn get(&self, path: &SyncPath) -> Option<&FolderNode> {
        self.id_of(path).and_then(|id| self.node(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut FolderNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Number of live nodes, root included
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Adds or updates a node, creating missing ancestor folders
    ///
    /// A new node inherits its parent's state; under a partially selected
    /// parent it starts deselected.
    pub fn insert(&mut self, path: &SyncPath, is_directory: bool, size_bytes: u64) -> NodeId {
        if let Some(id) = self.id_of(path) {
            if let Some(node) = self.node_mut(id) {
                node.is_directory = is_directory || !node.children.is_empty();
                node.size_bytes = if node.is_directory { 0 } else { size_bytes };
            }
            return id;
        }

        let parent_path = path.parent().unwrap_or_else(SyncPath::root);
        let parent = self.insert(&parent_path, true, 0);
        let inherited = match self.node(parent).map(|p| p.state) {
            Some(SelectionState::Selected) => SelectionState::Selected,
            _ => SelectionState::Deselected,
        };

        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(FolderNode {
            path: path.clone(),
            state: inherited,
            size_bytes: if is_directory { 0 } else { size_bytes },
            is_directory,
            parent: Some(parent),
            children: Vec::new(),
        }));
        self.index.insert(path.clone(), id);
        if let Some(p) = self.node_mut(parent) {
            p.is_directory = true;
            p.children.push(id);
        }
        self.recompute_ancestors(id);
        id
    }

    /// Removes a node and its subtree
    pub fn remove(&mut self, path: &SyncPath) {
        let Some(id) = self.id_of(path) else { return };
        if id == self.root() {
            return;
        }
        let parent = self.node(id).and_then(|n| n.parent);
        for doomed in self.subtree(id) {
            if let Some(node) = self.nodes.get_mut(doomed.0).and_then(Option::take) {
                self.index.remove(&node.path);
            }
        }
        if let Some(parent) = parent {
            if let Some(p) = self.node_mut(parent) {
                p.children.retain(|c| *c != id);
            }
            self.recompute_from(parent);
        }
    }

    /// `id` and all its descendants, parents before children
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(next) = queue.pop_front() {
            if let Some(node) = self.node(next) {
                out.push(next);
                queue.extend(node.children.iter().copied());
            }
        }
        out
    }

    /// Sum of own sizes across the subtree
    pub fn subtree_size(&self, id: NodeId) -> u64 {
        self.subtree(id)
            .into_iter()
            .filter_map(|n| self.node(n))
            .map(|n| n.size_bytes)
            .sum()
    }

    fn set_subtree(&mut self, id: NodeId, state: SelectionState) {
        for n in self.subtree(id) {
            if let Some(node) = self.node_mut(n) {
                node.state = state;
            }
        }
    }

    /// Re-derives `id` from its children (if any), then every ancestor
    fn recompute_from(&mut self, id: NodeId) {
        let mut current = Some(id);
        while let Some(n) = current {
            let aggregate = {
                let Some(node) = self.node(n) else { return };
                SelectionState::aggregate(
                    node.children
                        .iter()
                        .filter_map(|c| self.node(*c))
                        .map(|c| c.state),
                )
            };
            let Some(node) = self.node_mut(n) else { return };
            match aggregate {
                Some(state) => node.state = state,
                // A childless folder cannot be partial
                None if node.state == SelectionState::Partial => {
                    node.state = SelectionState::Deselected;
                }
                None => {}
            }
            current = node.parent;
        }
    }

    fn recompute_ancestors(&mut self, id: NodeId) {
        if let Some(parent) = self.node(id).and_then(|n| n.parent) {
            self.recompute_from(parent);
        }
    }

    /// Sets a node (and everything beneath it), then fixes up ancestors
    pub fn select(&mut self, id: NodeId, selected: bool) {
        self.set_subtree(id, SelectionState::from_bool(selected));
        self.recompute_ancestors(id);
    }

    /// Sets the children of `parent`
    ///
    /// With `recursive`, whole subtrees change. Otherwise only the direct
    /// children are set; a child folder keeps the aggregate of its own
    /// untouched children, so the call effectively toggles direct leaves.
    pub fn update_children(&mut self, parent: NodeId, selected: bool, recursive: bool) {
        let state = SelectionState::from_bool(selected);
        let children = self
            .node(parent)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        for child in &children {
            if recursive {
                self.set_subtree(*child, state);
            } else if let Some(node) = self.node_mut(*child) {
                node.state = state;
            }
        }
        if !recursive {
            // Non-leaf children re-derive from their grandchildren
            for child in &children {
                let has_children = self.node(*child).map_or(false, |n| !n.children.is_empty());
                if has_children {
                    let aggregate = {
                        let node = self.node(*child);
                        node.and_then(|n| {
                            SelectionState::aggregate(
                                n.children
                                    .iter()
                                    .filter_map(|c| self.node(*c))
                                    .map(|c| c.state),
                            )
                        })
                    };
                    if let (Some(state), Some(node)) = (aggregate, self.node_mut(*child)) {
                        node.state = state;
                    }
                }
            }
        }
        self.recompute_from(parent);
    }

    /// Maximal fully selected subtrees: selected nodes whose parent is not selected
    pub fn selected_roots(&self) -> Vec<SyncPath> {
        self.maximal(|n| n.state == SelectionState::Selected)
    }

    /// Maximal nodes matching `pred` whose parent does not match
    fn maximal(&self, pred: impl Fn(&FolderNode) -> bool) -> Vec<SyncPath> {
        let mut out: Vec<SyncPath> = self
            .nodes
            .iter()
            .flatten()
            .filter(|n| pred(*n))
            .filter(|n| {
                n.parent
                    .and_then(|p| self.node(p))
                    .map_or(true, |p| !pred(p))
            })
            .map(|n| n.path.clone())
            .collect();
        out.sort();
        out
    }

    /// Nearest node at or above `path`
    fn nearest(&self, path: &SyncPath) -> Option<&FolderNode> {
        self.get(path)
            .or_else(|| path.ancestors().find_map(|a| self.get(&a)))
    }
}

// ============================================================================
// SelectionDiff
// ============================================================================

/// Paths entering and leaving the local replica after a selection change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionDiff {
    /// Newly in scope: to be downloaded
    pub to_download: Vec<SyncPath>,
    /// Newly out of scope: to be deleted locally, never remotely
    pub to_remove_locally: Vec<SyncPath>,
}

impl SelectionDiff {
    pub fn is_empty(&self) -> bool {
        self.to_download.is_empty() && self.to_remove_locally.is_empty()
    }
}

// ============================================================================
// SelectiveSyncManager
// ============================================================================

/// Owns the selection tree and answers scope questions
pub struct SelectiveSyncManager {
    tree: RwLock<FolderTree>,
    /// Selected roots as last persisted
    baseline: RwLock<Vec<SyncPath>>,
    exclude: Vec<glob::Pattern>,
    repository: Arc<dyn IStateRepository>,
    events: Arc<EventHub>,
}

impl SelectiveSyncManager {
    /// Creates a manager with everything selected
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` for a malformed exclude pattern
    pub fn new(
        exclude_patterns: &[String],
        repository: Arc<dyn IStateRepository>,
        events: Arc<EventHub>,
    ) -> Result<Self, SyncError> {
        let exclude = exclude_patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| {
                    SyncError::InvalidConfiguration(format!("exclude pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            tree: RwLock::new(FolderTree::new()),
            baseline: RwLock::new(vec![SyncPath::root()]),
            exclude,
            repository,
            events,
        })
    }

    /// Restores the persisted selection
    ///
    /// Returns false when nothing was persisted, leaving everything selected.
    pub async fn load(&self) -> Result<bool, SyncError> {
        let Some(roots) = self
            .repository
            .load_selection()
            .await
            .map_err(storage_error)?
        else {
            debug!("No persisted selection, everything selected");
            return Ok(false);
        };

        let mut tree = self.tree.write().await;
        apply_roots(&mut tree, &roots);
        *self.baseline.write().await = roots.clone();
        info!(roots = roots.len(), "Loaded folder selection");
        Ok(true)
    }

    /// Seeds the selection from configured folder names (used on first run)
    pub async fn seed_from_config(&self, folders: &[String]) -> Result<(), SyncError> {
        if folders.is_empty() {
            return Ok(());
        }
        let roots = folders
            .iter()
            .map(|f| {
                let normalized = if f.starts_with('/') {
                    f.clone()
                } else {
                    format!("/{f}")
                };
                normalized.parse::<SyncPath>().map_err(SyncError::from)
            })
            .collect::<Result<Vec<_>, _>>()?;
        apply_roots(&mut *self.tree.write().await, &roots);
        *self.baseline.write().await = roots;
        Ok(())
    }

    /// Rebuilds the tree from the cloud, keeping the current selection
    ///
    /// Returns the number of nodes loaded.
    pub async fn load_folder_tree(&self, cloud: &dyn ICloudApi) -> Result<usize, SyncError> {
        let mut fresh = FolderTree::new();
        let mut queue = VecDeque::from([SyncPath::root()]);
        while let Some(folder) = queue.pop_front() {
            for entry in cloud.list_folder(&folder).await? {
                fresh.insert(&entry.path, entry.is_directory, entry.size);
                if entry.is_directory {
                    queue.push_back(entry.path);
                }
            }
        }

        let mut tree = self.tree.write().await;
        let roots = tree.selected_roots();
        apply_roots(&mut fresh, &roots);
        *tree = fresh;
        info!(nodes = tree.len(), "Folder tree loaded");
        Ok(tree.len())
    }

    /// Returns a snapshot of the tree
    pub async fn folder_tree(&self) -> FolderTree {
        self.tree.read().await.clone()
    }

    /// Records an item seen in the cloud
    pub async fn add_entry(&self, path: &SyncPath, is_directory: bool, size: u64) {
        self.tree.write().await.insert(path, is_directory, size);
    }

    pub async fn remove_entry(&self, path: &SyncPath) {
        self.tree.write().await.remove(path);
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Selects or deselects a folder and everything beneath it
    pub async fn select_folder(&self, path: &SyncPath, selected: bool) -> Result<(), SyncError> {
        let affected_size = {
            let mut tree = self.tree.write().await;
            let id = match tree.id_of(path) {
                Some(id) => id,
                None => tree.insert(path, true, 0),
            };
            tree.select(id, selected);
            tree.subtree_size(id)
        };

        debug!(path = %path, selected, affected_size, "Folder selection changed");
        self.events.publish_selection(SelectionChange {
            path: path.clone(),
            is_selected: selected,
            affected_size,
        });
        Ok(())
    }

    pub async fn select_folders(&self, paths: &[SyncPath]) -> Result<(), SyncError> {
        for path in paths {
            self.select_folder(path, true).await?;
        }
        Ok(())
    }

    pub async fn deselect_folders(&self, paths: &[SyncPath]) -> Result<(), SyncError> {
        for path in paths {
            self.select_folder(path, false).await?;
        }
        Ok(())
    }

    /// Sets the children of `parent`; see [`FolderTree::update_children`]
    pub async fn update_children_selection(
        &self,
        parent: &SyncPath,
        selected: bool,
        recursive: bool,
    ) -> Result<(), SyncError> {
        let affected_size = {
            let mut tree = self.tree.write().await;
            let id = tree
                .id_of(parent)
                .ok_or_else(|| SyncError::FileNotFound(parent.to_string()))?;
            tree.update_children(id, selected, recursive);
            tree.subtree_size(id)
        };
        self.events.publish_selection(SelectionChange {
            path: parent.clone(),
            is_selected: selected,
            affected_size,
        });
        Ok(())
    }

    pub async fn select_all(&self) -> Result<(), SyncError> {
        self.select_folder(&SyncPath::root(), true).await
    }

    pub async fn deselect_all(&self) -> Result<(), SyncError> {
        self.select_folder(&SyncPath::root(), false).await
    }

    pub async fn selection_state(&self, path: &SyncPath) -> Option<SelectionState> {
        self.tree.read().await.get(path).map(|n| n.state)
    }

    /// True unless everything is deselected
    pub async fn has_selection(&self) -> bool {
        let tree = self.tree.read().await;
        tree.node(tree.root())
            .map_or(false, |r| r.state != SelectionState::Deselected)
    }

    /// Fully selected subtree roots
    pub async fn selected_paths(&self) -> Vec<SyncPath> {
        self.tree.read().await.selected_roots()
    }

    // ========================================================================
    // Scope
    // ========================================================================

    /// True if the file name matches an exclude pattern
    pub fn is_excluded(&self, path: &SyncPath) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        self.exclude.iter().any(|p| p.matches(name))
    }

    /// True if `path` belongs to the local replica
    ///
    /// Known nodes are in scope unless deselected. Unknown paths follow
    /// their nearest known ancestor; under a partially selected folder they
    /// are in scope, since the folder itself is synced.
    pub async fn is_in_scope(&self, path: &SyncPath) -> bool {
        if self.is_excluded(path) {
            return false;
        }
        let tree = self.tree.read().await;
        match tree.nearest(path) {
            Some(node) => node.state != SelectionState::Deselected,
            None => true,
        }
    }

    /// Bytes to download for `paths` and their descendants, counted once
    pub async fn estimate_download_size(&self, paths: &[SyncPath]) -> u64 {
        let tree = self.tree.read().await;
        let mut seen = HashSet::new();
        for path in paths {
            if let Some(id) = tree.id_of(path) {
                seen.extend(tree.subtree(id));
            }
        }
        seen.into_iter()
            .filter_map(|id| tree.node(id))
            .map(|n| n.size_bytes)
            .sum()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Diffs the tree against the persisted selection and persists the new one
    pub async fn apply_selection_changes(&self) -> Result<SelectionDiff, SyncError> {
        let tree = self.tree.read().await;
        let previous = self.baseline.read().await.clone();
        let was_in_scope = |p: &SyncPath| previous.iter().any(|root| p.is_within(root));

        let to_download = tree.maximal(|n| {
            n.state == SelectionState::Selected && !was_in_scope(&n.path)
        });
        let to_remove_locally = tree.maximal(|n| {
            n.state == SelectionState::Deselected && was_in_scope(&n.path)
        });

        let current = tree.selected_roots();
        drop(tree);

        self.repository
            .save_selection(&current)
            .await
            .map_err(storage_error)?;
        *self.baseline.write().await = current;

        let diff = SelectionDiff {
            to_download,
            to_remove_locally,
        };
        if !diff.is_empty() {
            info!(
                download = diff.to_download.len(),
                remove = diff.to_remove_locally.len(),
                "Selection changes applied"
            );
        }
        Ok(diff)
    }

    /// Persists the current selection without diffing
    pub async fn save(&self) -> Result<(), SyncError> {
        let current = self.tree.read().await.selected_roots();
        self.repository
            .save_selection(&current)
            .await
            .map_err(storage_error)?;
        *self.baseline.write().await = current;
        Ok(())
    }
}

/// Deselects everything, then selects each of `roots`
fn apply_roots(tree: &mut FolderTree, roots: &[SyncPath]) {
    let root = tree.root();
    tree.select(root, false);
    for path in roots {
        let id = match tree.id_of(path) {
            Some(id) => id,
            None => {
                warn!(path = %path, "Selected folder not in tree, adding it");
                tree.insert(path, true, 0)
            }
        };
        tree.select(id, true);
    }
}

#[cfg(test)]
mod tests {
    use cloudsync_core::testing::InMemoryCloud;

    use super::*;

    fn path(s: &str) -> SyncPath {
        s.parse().unwrap()
    }

    /// /Docs/{a.txt(10), b.txt(20)}, /Docs/Old/c.txt(5), /Photos/p.jpg(100)
    fn sample_tree() -> FolderTree {
        let mut tree = FolderTree::new();
        tree.insert(&path("/Docs/a.txt"), false, 10);
        tree.insert(&path("/Docs/b.txt"), false, 20);
        tree.insert(&path("/Docs/Old/c.txt"), false, 5);
        tree.insert(&path("/Photos/p.jpg"), false, 100);
        tree
    }

    fn state(tree: &FolderTree, p: &str) -> SelectionState {
        tree.get(&path(p)).unwrap().state()
    }

    #[test]
    fn test_insert_creates_ancestors() {
        let tree = sample_tree();
        assert!(tree.get(&path("/Docs")).unwrap().is_directory());
        assert_eq!(tree.get(&path("/Docs")).unwrap().children().len(), 3);
        assert_eq!(tree.len(), 8);
        assert_eq!(tree.subtree_size(tree.root()), 135);
    }

    #[test]
    fn test_deselecting_one_leaf_makes_parent_partial() {
        let mut tree = sample_tree();
        let b = tree.id_of(&path("/Docs/b.txt")).unwrap();
        tree.select(b, false);

        assert_eq!(state(&tree, "/Docs"), SelectionState::Partial);
        assert_eq!(state(&tree, "/"), SelectionState::Partial);
        assert_eq!(state(&tree, "/Photos"), SelectionState::Selected);
    }

    #[test]
    fn test_selecting_all_leaves_selects_parent() {
        let mut tree = sample_tree();
        let root = tree.root();
        tree.select(root, false);
        for p in ["/Docs/a.txt", "/Docs/b.txt", "/Docs/Old/c.txt"] {
            let id = tree.id_of(&path(p)).unwrap();
            tree.select(id, true);
        }
        assert_eq!(state(&tree, "/Docs/Old"), SelectionState::Selected);
        assert_eq!(state(&tree, "/Docs"), SelectionState::Selected);
        assert_eq!(state(&tree, "/"), SelectionState::Partial);
    }

    #[test]
    fn test_non_recursive_update_leaves_grandchildren() {
        let mut tree = sample_tree();
        let docs = tree.id_of(&path("/Docs")).unwrap();
        tree.update_children(docs, false, false);

        assert_eq!(state(&tree, "/Docs/a.txt"), SelectionState::Deselected);
        assert_eq!(state(&tree, "/Docs/Old/c.txt"), SelectionState::Selected);
        assert_eq!(state(&tree, "/Docs/Old"), SelectionState::Selected);
        assert_eq!(state(&tree, "/Docs"), SelectionState::Partial);

        tree.update_children(docs, false, true);
        assert_eq!(state(&tree, "/Docs/Old/c.txt"), SelectionState::Deselected);
        assert_eq!(state(&tree, "/Docs"), SelectionState::Deselected);
    }

    #[test]
    fn test_selected_roots_are_maximal() {
        let mut tree = sample_tree();
        let photos = tree.id_of(&path("/Photos")).unwrap();
        tree.select(photos, false);
        assert_eq!(tree.selected_roots(), vec![path("/Docs")]);

        let root = tree.root();
        tree.select(root, true);
        assert_eq!(tree.selected_roots(), vec![SyncPath::root()]);
    }

    #[test]
    fn test_remove_recomputes_parent() {
        let mut tree = sample_tree();
        let b = tree.id_of(&path("/Docs/b.txt")).unwrap();
        tree.select(b, false);
        tree.remove(&path("/Docs/b.txt"));
        assert!(tree.get(&path("/Docs/b.txt")).is_none());
        assert_eq!(state(&tree, "/Docs"), SelectionState::Selected);
    }

    #[test]
    fn test_folder_emptied_of_children_is_never_partial() {
        let mut tree = FolderTree::new();
        tree.insert(&path("/A/Sub/x"), false, 1);
        tree.insert(&path("/A/Sub/y"), false, 1);
        let y = tree.id_of(&path("/A/Sub/y")).unwrap();
        tree.select(y, false);
        assert_eq!(state(&tree, "/A"), SelectionState::Partial);

        tree.remove(&path("/A/Sub"));

        assert!(tree.get(&path("/A")).unwrap().children().is_empty());
        assert_eq!(state(&tree, "/A"), SelectionState::Deselected);
        assert_eq!(state(&tree, "/"), SelectionState::Deselected);
    }

    async fn manager() -> (SelectiveSyncManager, Arc<dyn IStateRepository>) {
        let pool = cloudsync_cache::DatabasePool::in_memory().await.unwrap();
        let repo: Arc<dyn IStateRepository> = Arc::new(
            cloudsync_cache::SqliteStateRepository::new(pool.pool().clone()),
        );
        let manager = SelectiveSyncManager::new(
            &["*.tmp".to_string()],
            repo.clone(),
            Arc::new(EventHub::new()),
        )
        .unwrap();
        {
            let mut tree = manager.tree.write().await;
            *tree = sample_tree();
        }
        (manager, repo)
    }

    #[tokio::test]
    async fn test_scope_follows_selection_and_excludes() {
        let (m, _) = manager().await;
        m.select_folder(&path("/Photos"), false).await.unwrap();

        assert!(m.is_in_scope(&path("/Docs/a.txt")).await);
        assert!(m.is_in_scope(&path("/Docs/new-file.md")).await);
        assert!(!m.is_in_scope(&path("/Photos/p.jpg")).await);
        assert!(!m.is_in_scope(&path("/Photos/2024/new.jpg")).await);
        assert!(!m.is_in_scope(&path("/Docs/scratch.tmp")).await);
        // Root is partial: unknown top-level items are still in scope
        assert!(m.is_in_scope(&path("/loose.txt")).await);
    }

    #[tokio::test]
    async fn test_estimate_does_not_double_count() {
        let (m, _) = manager().await;
        let size = m
            .estimate_download_size(&[path("/Docs"), path("/Docs/Old"), path("/Docs/a.txt")])
            .await;
        assert_eq!(size, 35);
        assert_eq!(m.estimate_download_size(&[path("/missing")]).await, 0);
    }

    #[tokio::test]
    async fn test_apply_selection_changes_diffs_against_persisted() {
        let (m, repo) = manager().await;
        m.save().await.unwrap();

        m.select_folder(&path("/Photos"), false).await.unwrap();
        let diff = m.apply_selection_changes().await.unwrap();
        assert_eq!(diff.to_remove_locally, vec![path("/Photos")]);
        assert!(diff.to_download.is_empty());
        assert_eq!(
            repo.load_selection().await.unwrap(),
            Some(vec![path("/Docs")])
        );

        m.select_folder(&path("/Photos"), true).await.unwrap();
        let diff = m.apply_selection_changes().await.unwrap();
        assert_eq!(diff.to_download, vec![path("/Photos")]);
        assert!(diff.to_remove_locally.is_empty());

        // Nothing changed since the last apply
        assert!(m.apply_selection_changes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_selection_survives_reload() {
        let (m, repo) = manager().await;
        m.deselect_all().await.unwrap();
        assert!(!m.has_selection().await);
        m.select_folders(&[path("/Docs/Old")]).await.unwrap();
        m.save().await.unwrap();

        let fresh =
            SelectiveSyncManager::new(&[], repo.clone(), Arc::new(EventHub::new())).unwrap();
        assert!(fresh.load().await.unwrap());
        assert_eq!(fresh.selected_paths().await, vec![path("/Docs/Old")]);
        assert!(!fresh.is_in_scope(&path("/Photos/p.jpg")).await);
        assert!(fresh.is_in_scope(&path("/Docs/Old/c.txt")).await);
    }

    #[tokio::test]
    async fn test_selection_events_carry_size() {
        let (m, _) = manager().await;
        let mut rx = m.events.selection_changes();
        m.select_folder(&path("/Docs"), false).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(!event.is_selected);
        assert_eq!(event.affected_size, 35);
    }

    #[tokio::test]
    async fn test_load_folder_tree_from_cloud_keeps_selection() {
        let (m, _) = manager().await;
        let cloud = InMemoryCloud::new();
        cloud.put_remote("/Docs/a.txt", b"0123456789");
        cloud.put_remote("/Music/song.mp3", b"la la");
        m.select_folder(&path("/Photos"), false).await.unwrap();

        let count = m.load_folder_tree(&cloud).await.unwrap();
        assert_eq!(count, 5);
        assert_eq!(
            m.selection_state(&path("/Docs")).await,
            Some(SelectionState::Selected)
        );
        // New remote folders appear under a partial root deselected
        assert_eq!(
            m.selection_state(&path("/Music")).await,
            Some(SelectionState::Deselected)
        );
    }
}
