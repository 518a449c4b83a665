//! In-memory port implementations for tests
//!
//! Enabled with the `test-util` feature. [`InMemoryCloud`] keeps a change
//! log so the feed can be replayed from any cursor, [`InMemoryFileSystem`]
//! models a local tree, and [`RecordingNotifier`] captures notifications.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::domain::{ContentHash, Cursor, SyncError, SyncPath, VersionTag};
use crate::ports::{
    ChangeSet, FileAttributes, ICloudApi, IFileSystem, INotificationService, Notification,
    ProgressCallback, RemoteChange, RemoteEntry,
};

/// Deterministic content hash shared by the in-memory adapters
pub fn content_hash_of(data: &[u8]) -> ContentHash {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    // Hex of a u64 is never empty and has no whitespace
    ContentHash::new(format!("{:016x}", hasher.finish())).expect("hex hash is valid")
}

fn cursor_at(position: usize) -> Cursor {
    Cursor::new(format!("c{position}")).expect("cursor is valid")
}

fn path(s: &str) -> SyncPath {
    s.parse().expect("test path is valid")
}

// ============================================================================
// InMemoryCloud
// ============================================================================

#[derive(Default)]
struct CloudState {
    entries: BTreeMap<SyncPath, (RemoteEntry, Vec<u8>)>,
    log: Vec<RemoteChange>,
    next_version: u64,
    next_id: u64,
    offline: Option<SyncError>,
    failures: HashMap<&'static str, Vec<SyncError>>,
    calls: HashMap<&'static str, usize>,
}

impl CloudState {
    fn check(&mut self, op: &'static str) -> Result<(), SyncError> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(err) = &self.offline {
            return Err(err.clone());
        }
        if let Some(queue) = self.failures.get_mut(op) {
            if !queue.is_empty() {
                return Err(queue.remove(0));
            }
        }
        Ok(())
    }

    fn next_tag(&mut self) -> VersionTag {
        self.next_version += 1;
        VersionTag::new(format!("v{}", self.next_version)).expect("tag is valid")
    }

    fn ensure_parents(&mut self, p: &SyncPath) {
        let mut missing: Vec<SyncPath> = p
            .ancestors()
            .filter(|a| !a.is_root() && !self.entries.contains_key(a))
            .collect();
        missing.reverse();
        for folder in missing {
            let entry = self.folder_entry(&folder);
            self.log.push(RemoteChange::Upserted(entry.clone()));
            self.entries.insert(folder, (entry, Vec::new()));
        }
    }

    fn folder_entry(&mut self, p: &SyncPath) -> RemoteEntry {
        self.next_id += 1;
        RemoteEntry {
            path: p.clone(),
            remote_id: format!("id-{}", self.next_id),
            is_directory: true,
            size: 0,
            content_hash: None,
            version_tag: Some(self.next_tag()),
            modified_at: Utc::now(),
        }
    }

    fn store(&mut self, p: &SyncPath, data: Vec<u8>, modified_at: DateTime<Utc>) -> RemoteEntry {
        self.ensure_parents(p);
        let remote_id = match self.entries.get(p) {
            Some((entry, _)) => entry.remote_id.clone(),
            None => {
                self.next_id += 1;
                format!("id-{}", self.next_id)
            }
        };
        let entry = RemoteEntry {
            path: p.clone(),
            remote_id,
            is_directory: false,
            size: data.len() as u64,
            content_hash: Some(content_hash_of(&data)),
            version_tag: Some(self.next_tag()),
            modified_at,
        };
        self.entries.insert(p.clone(), (entry.clone(), data));
        self.log.push(RemoteChange::Upserted(entry.clone()));
        entry
    }

    fn remove_tree(&mut self, p: &SyncPath) -> bool {
        let doomed: Vec<SyncPath> = self
            .entries
            .keys()
            .filter(|k| k.is_within(p))
            .cloned()
            .collect();
        for k in &doomed {
            self.entries.remove(k);
        }
        if !doomed.is_empty() {
            self.log.push(RemoteChange::Deleted { path: p.clone() });
        }
        !doomed.is_empty()
    }
}

/// An in-memory cloud with a replayable change feed
#[derive(Default)]
pub struct InMemoryCloud {
    state: Mutex<CloudState>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates another client writing a file
    pub fn put_remote(&self, p: &str, data: &[u8]) -> RemoteEntry {
        let mut state = self.state.lock().unwrap();
        state.store(&path(p), data.to_vec(), Utc::now())
    }

    /// Simulates another client deleting a file or folder
    pub fn delete_remote(&self, p: &str) {
        let mut state = self.state.lock().unwrap();
        state.remove_tree(&path(p));
    }

    /// Simulates another client moving an item
    pub fn move_remote(&self, from: &str, to: &str) {
        let mut state = self.state.lock().unwrap();
        let (from, to) = (path(from), path(to));
        if let Some((mut entry, data)) = state.entries.remove(&from) {
            entry.path = to.clone();
            entry.version_tag = Some(state.next_tag());
            state.entries.insert(to.clone(), (entry.clone(), data));
            state.log.push(RemoteChange::Moved { from, entry });
        }
    }

    /// Creates a folder without recording any file
    pub fn put_folder(&self, p: &str) {
        let mut state = self.state.lock().unwrap();
        let p = path(p);
        state.ensure_parents(&p);
        if !state.entries.contains_key(&p) {
            let entry = state.folder_entry(&p);
            state.log.push(RemoteChange::Upserted(entry.clone()));
            state.entries.insert(p, (entry, Vec::new()));
        }
    }

    pub fn content(&self, p: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.entries.get(&path(p)).map(|(_, d)| d.clone())
    }

    pub fn entry(&self, p: &str) -> Option<RemoteEntry> {
        let state = self.state.lock().unwrap();
        state.entries.get(&path(p)).map(|(e, _)| e.clone())
    }

    pub fn file_paths(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .values()
            .filter(|(e, _)| !e.is_directory)
            .map(|(e, _)| e.path.to_string())
            .collect()
    }

    /// Makes every call fail with `err` until cleared with `None`
    pub fn set_offline(&self, err: Option<SyncError>) {
        self.state.lock().unwrap().offline = err;
    }

    /// Queues a failure for the next call(s) of `op` (e.g. "upload_file")
    pub fn fail_next(&self, op: &'static str, err: SyncError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push(err);
    }

    /// Number of times `op` was called
    pub fn calls(&self, op: &'static str) -> usize {
        *self.state.lock().unwrap().calls.get(op).unwrap_or(&0)
    }

    /// Cursor pointing at the end of the change log
    pub fn latest_cursor(&self) -> Cursor {
        cursor_at(self.state.lock().unwrap().log.len())
    }
}

#[async_trait::async_trait]
impl ICloudApi for InMemoryCloud {
    async fn upload_file(
        &self,
        path: &SyncPath,
        data: Vec<u8>,
        if_match: Option<&VersionTag>,
        progress: Option<ProgressCallback>,
    ) -> Result<RemoteEntry, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.check("upload_file")?;
        if let Some(expected) = if_match {
            let actual = state
                .entries
                .get(path)
                .and_then(|(e, _)| e.version_tag.clone());
            if actual.as_ref() != Some(expected) {
                return Err(SyncError::VersionMismatch {
                    path: path.to_string(),
                    expected: Some(expected.to_string()),
                    actual: actual.map(|t| t.to_string()),
                });
            }
        }
        let len = data.len() as u64;
        let entry = state.store(path, data, Utc::now());
        if let Some(cb) = progress {
            cb(len, len);
        }
        Ok(entry)
    }

    async fn download_file(
        &self,
        path: &SyncPath,
        progress: Option<ProgressCallback>,
    ) -> Result<(RemoteEntry, Vec<u8>), SyncError> {
        let mut state = self.state.lock().unwrap();
        state.check("download_file")?;
        let (entry, data) = state
            .entries
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::FileNotFound(path.to_string()))?;
        if let Some(cb) = progress {
            cb(data.len() as u64, data.len() as u64);
        }
        Ok((entry, data))
    }

    async fn get_changes(&self, cursor: Option<&Cursor>) -> Result<ChangeSet, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.check("get_changes")?;
        let start = match cursor {
            Some(c) => Some(
                c.as_str()
                    .strip_prefix('c')
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| SyncError::InvalidConfiguration(format!("bad cursor {c}")))?,
            ),
            None => None,
        };
        let changes = if let Some(start) = start {
            state.log.get(start..).map(<[_]>::to_vec).unwrap_or_default()
        } else {
            // From scratch: current state rather than history
            state
                .entries
                .values()
                .map(|(e, _)| RemoteChange::Upserted(e.clone()))
                .collect()
        };
        Ok(ChangeSet {
            changes,
            cursor: Some(cursor_at(state.log.len())),
            has_more: false,
        })
    }

    async fn list_folder(&self, folder: &SyncPath) -> Result<Vec<RemoteEntry>, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.check("list_folder")?;
        Ok(state
            .entries
            .values()
            .filter(|(e, _)| e.path.parent().as_ref() == Some(folder))
            .map(|(e, _)| e.clone())
            .collect())
    }

    async fn create_folder(&self, folder: &SyncPath) -> Result<RemoteEntry, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.check("create_folder")?;
        state.ensure_parents(folder);
        if let Some((entry, _)) = state.entries.get(folder) {
            return Ok(entry.clone());
        }
        let entry = state.folder_entry(folder);
        state.log.push(RemoteChange::Upserted(entry.clone()));
        state.entries.insert(folder.clone(), (entry.clone(), Vec::new()));
        Ok(entry)
    }

    async fn delete_file(&self, path: &SyncPath) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        state.check("delete_file")?;
        state.remove_tree(path);
        Ok(())
    }

    async fn delete_folder(&self, path: &SyncPath) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        state.check("delete_folder")?;
        state.remove_tree(path);
        Ok(())
    }

    async fn move_item(&self, from: &SyncPath, to: &SyncPath) -> Result<RemoteEntry, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.check("move_item")?;
        let (mut entry, data) = state
            .entries
            .remove(from)
            .ok_or_else(|| SyncError::FileNotFound(from.to_string()))?;
        state.ensure_parents(to);
        entry.path = to.clone();
        entry.version_tag = Some(state.next_tag());
        state.entries.insert(to.clone(), (entry.clone(), data));
        state.log.push(RemoteChange::Moved {
            from: from.clone(),
            entry: entry.clone(),
        });
        Ok(entry)
    }

    async fn get_metadata(&self, path: &SyncPath) -> Result<Option<RemoteEntry>, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.check("get_metadata")?;
        Ok(state.entries.get(path).map(|(e, _)| e.clone()))
    }
}

// ============================================================================
// InMemoryFileSystem
// ============================================================================

#[derive(Clone)]
struct LocalNode {
    /// `None` for directories
    data: Option<Vec<u8>>,
    modified_at: DateTime<Utc>,
}

/// An in-memory local tree
pub struct InMemoryFileSystem {
    nodes: Mutex<BTreeMap<SyncPath, LocalNode>>,
    available_space: Mutex<u64>,
    failures: Mutex<HashMap<SyncPath, SyncError>>,
}

impl Default for InMemoryFileSystem {
    fn default() -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            available_space: Mutex::new(u64::MAX),
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl InMemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the user writing a file
    pub fn put(&self, p: &str, data: &[u8]) {
        self.insert(&path(p), Some(data.to_vec()));
    }

    pub fn put_dir(&self, p: &str) {
        self.insert(&path(p), None);
    }

    pub fn remove(&self, p: &str) {
        let p = path(p);
        self.nodes.lock().unwrap().retain(|k, _| !k.is_within(&p));
    }

    pub fn content(&self, p: &str) -> Option<Vec<u8>> {
        self.nodes
            .lock()
            .unwrap()
            .get(&path(p))
            .and_then(|n| n.data.clone())
    }

    pub fn exists(&self, p: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(&path(p))
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, n)| n.data.is_some())
            .map(|(k, _)| k.to_string())
            .collect()
    }

    pub fn set_available_space(&self, bytes: u64) {
        *self.available_space.lock().unwrap() = bytes;
    }

    /// Makes every operation on `p` fail with `err`
    pub fn fail_path(&self, p: &str, err: SyncError) {
        self.failures.lock().unwrap().insert(path(p), err);
    }

    fn check(&self, p: &SyncPath) -> Result<(), SyncError> {
        match self.failures.lock().unwrap().get(p) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn insert(&self, p: &SyncPath, data: Option<Vec<u8>>) {
        let mut nodes = self.nodes.lock().unwrap();
        for ancestor in p.ancestors().filter(|a| !a.is_root()) {
            nodes.entry(ancestor).or_insert(LocalNode {
                data: None,
                modified_at: Utc::now(),
            });
        }
        nodes.insert(
            p.clone(),
            LocalNode {
                data,
                modified_at: Utc::now(),
            },
        );
    }
}

#[async_trait::async_trait]
impl IFileSystem for InMemoryFileSystem {
    async fn read_file(&self, path: &SyncPath) -> Result<Vec<u8>, SyncError> {
        self.check(path)?;
        self.nodes
            .lock()
            .unwrap()
            .get(path)
            .and_then(|n| n.data.clone())
            .ok_or_else(|| SyncError::FileNotFound(path.to_string()))
    }

    async fn write_file(&self, path: &SyncPath, data: &[u8]) -> Result<(), SyncError> {
        self.check(path)?;
        self.insert(path, Some(data.to_vec()));
        Ok(())
    }

    async fn delete_item(&self, path: &SyncPath) -> Result<(), SyncError> {
        self.check(path)?;
        self.nodes.lock().unwrap().retain(|k, _| !k.is_within(path));
        Ok(())
    }

    async fn create_directory(&self, path: &SyncPath) -> Result<(), SyncError> {
        self.check(path)?;
        if !self.nodes.lock().unwrap().contains_key(path) {
            self.insert(path, None);
        }
        Ok(())
    }

    async fn move_item(&self, from: &SyncPath, to: &SyncPath) -> Result<(), SyncError> {
        self.check(from)?;
        let mut nodes = self.nodes.lock().unwrap();
        let moved: Vec<(SyncPath, LocalNode)> = nodes
            .iter()
            .filter(|(k, _)| k.is_within(from))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if moved.is_empty() {
            return Err(SyncError::FileNotFound(from.to_string()));
        }
        for ancestor in to.ancestors().filter(|a| !a.is_root() && a != to) {
            nodes.entry(ancestor).or_insert(LocalNode {
                data: None,
                modified_at: Utc::now(),
            });
        }
        for (old, node) in moved {
            nodes.remove(&old);
            let suffix = &old.as_str()[from.as_str().len()..];
            let new_path: SyncPath = format!("{}{}", to.as_str(), suffix)
                .parse()
                .map_err(SyncError::from)?;
            nodes.insert(new_path, node);
        }
        Ok(())
    }

    async fn get_file_attributes(
        &self,
        path: &SyncPath,
    ) -> Result<Option<FileAttributes>, SyncError> {
        self.check(path)?;
        Ok(self.nodes.lock().unwrap().get(path).map(|n| FileAttributes {
            size: n.data.as_ref().map(|d| d.len() as u64).unwrap_or(0),
            modified_at: n.modified_at,
            is_directory: n.data.is_none(),
        }))
    }

    async fn list_directory(&self, path: &SyncPath) -> Result<Vec<SyncPath>, SyncError> {
        self.check(path)?;
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.parent().as_ref() == Some(path))
            .cloned()
            .collect())
    }

    async fn compute_hash(&self, path: &SyncPath) -> Result<ContentHash, SyncError> {
        let data = self.read_file(path).await?;
        Ok(content_hash_of(&data))
    }

    async fn get_available_space(&self) -> Result<u64, SyncError> {
        Ok(*self.available_space.lock().unwrap())
    }
}

// ============================================================================
// RecordingNotifier
// ============================================================================

/// Captures every notification sent
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl INotificationService for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
