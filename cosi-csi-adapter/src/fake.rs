//! In-memory substitutes for the cluster, filesystem and mount capabilities.
//!
//! Used by the unit and integration tests to drive the lifecycle engine
//! without a cluster, root privileges or a real mount table.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;

use crate::client::ResourceClient;
use crate::error::ClientError;
use crate::events::EventPublisher;
use crate::provisioner::{FileSystem, Mounter};
use crate::types::{
    AccessGrant, AccessRequest, BucketRecord, Protocol, ResourceKind, S3, SecretPayload, SecretRef,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not cascade into unrelated assertions
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// FakeResourceClient
// ============================================================================

pub const NAMESPACE: &str = "team-a";
pub const POD_NAME: &str = "app-0";
pub const BAR_NAME: &str = "bar-1";
pub const BA_NAME: &str = "ba-1";
pub const BUCKET_NAME: &str = "bucket-1";
pub const SECRET_NAMESPACE: &str = "cosi-system";
pub const SECRET_NAME: &str = "ba-1-creds";

#[derive(Default)]
struct ClusterState {
    requests: HashMap<(String, String), AccessRequest>,
    grants: HashMap<String, AccessGrant>,
    buckets: HashMap<String, BucketRecord>,
    secrets: HashMap<(String, String), SecretPayload>,
    calls: Vec<String>,
    fail_add_finalizer: bool,
    fail_remove_finalizer: bool,
}

/// [`ResourceClient`] over in-memory objects that records every call.
#[derive(Default)]
pub struct FakeResourceClient {
    state: Mutex<ClusterState>,
}

impl FakeResourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_access_request(&self, request: AccessRequest) {
        let key = (request.namespace.clone(), request.name.clone());
        lock(&self.state).requests.insert(key, request);
    }

    pub fn insert_access_grant(&self, grant: AccessGrant) {
        lock(&self.state).grants.insert(grant.name.clone(), grant);
    }

    pub fn insert_bucket(&self, bucket: BucketRecord) {
        lock(&self.state).buckets.insert(bucket.name.clone(), bucket);
    }

    pub fn insert_secret(&self, namespace: &str, name: &str, secret: SecretPayload) {
        lock(&self.state)
            .secrets
            .insert((namespace.to_string(), name.to_string()), secret);
    }

    pub fn update_access_request(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut AccessRequest),
    ) {
        let mut state = lock(&self.state);
        if let Some(request) = state
            .requests
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            f(request);
        }
    }

    pub fn update_access_grant(&self, name: &str, f: impl FnOnce(&mut AccessGrant)) {
        if let Some(grant) = lock(&self.state).grants.get_mut(name) {
            f(grant);
        }
    }

    pub fn update_bucket(&self, name: &str, f: impl FnOnce(&mut BucketRecord)) {
        if let Some(bucket) = lock(&self.state).buckets.get_mut(name) {
            f(bucket);
        }
    }

    pub fn remove_access_grant(&self, name: &str) {
        lock(&self.state).grants.remove(name);
    }

    pub fn remove_secret(&self, namespace: &str, name: &str) {
        lock(&self.state)
            .secrets
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Current state of an access grant.
    pub fn access_grant(&self, name: &str) -> Option<AccessGrant> {
        lock(&self.state).grants.get(name).cloned()
    }

    /// Calls made so far, formatted as `"<method> <key>"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub fn fail_add_finalizer(&self, fail: bool) {
        lock(&self.state).fail_add_finalizer = fail;
    }

    pub fn fail_remove_finalizer(&self, fail: bool) {
        lock(&self.state).fail_remove_finalizer = fail;
    }
}

fn not_found(kind: ResourceKind, name: &str) -> ClientError {
    ClientError::NotFound {
        kind,
        name: name.to_string(),
    }
}

fn injected(kind: ResourceKind, name: &str) -> ClientError {
    ClientError::Api {
        kind,
        name: name.to_string(),
        message: "injected failure".to_string(),
    }
}

#[tonic::async_trait]
impl ResourceClient for FakeResourceClient {
    async fn get_access_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AccessRequest, ClientError> {
        let mut state = lock(&self.state);
        state
            .calls
            .push(format!("get_access_request {}/{}", namespace, name));
        state
            .requests
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::AccessRequest, name))
    }

    async fn get_access_grant(&self, name: &str) -> Result<AccessGrant, ClientError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("get_access_grant {}", name));
        state
            .grants
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::AccessGrant, name))
    }

    async fn get_bucket(&self, name: &str) -> Result<BucketRecord, ClientError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("get_bucket {}", name));
        state
            .buckets
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::Bucket, name))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretPayload, ClientError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("get_secret {}/{}", namespace, name));
        state
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::Secret, name))
    }

    async fn add_grant_finalizer(&self, name: &str, finalizer: &str) -> Result<bool, ClientError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("add_grant_finalizer {}", name));
        if state.fail_add_finalizer {
            return Err(injected(ResourceKind::AccessGrant, name));
        }
        let grant = state
            .grants
            .get_mut(name)
            .ok_or_else(|| not_found(ResourceKind::AccessGrant, name))?;
        if grant.has_finalizer(finalizer) {
            return Ok(false);
        }
        grant.finalizers.push(finalizer.to_string());
        Ok(true)
    }

    async fn remove_grant_finalizer(
        &self,
        name: &str,
        finalizer: &str,
    ) -> Result<bool, ClientError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("remove_grant_finalizer {}", name));
        if state.fail_remove_finalizer {
            return Err(injected(ResourceKind::AccessGrant, name));
        }
        let grant = state
            .grants
            .get_mut(name)
            .ok_or_else(|| not_found(ResourceKind::AccessGrant, name))?;
        let before = grant.finalizers.len();
        grant.finalizers.retain(|f| f != finalizer);
        Ok(grant.finalizers.len() != before)
    }
}

/// A fully ready request -> grant -> bucket -> secret chain for an S3 bucket.
pub fn ready_chain() -> FakeResourceClient {
    let client = FakeResourceClient::new();
    client.insert_access_request(AccessRequest {
        name: BAR_NAME.to_string(),
        namespace: NAMESPACE.to_string(),
        bucket_request_name: "br-1".to_string(),
        access_granted: true,
        bucket_access_name: BA_NAME.to_string(),
    });
    client.insert_access_grant(AccessGrant {
        name: BA_NAME.to_string(),
        bucket_name: BUCKET_NAME.to_string(),
        access_granted: true,
        minted_secret: Some(SecretRef::new(SECRET_NAMESPACE, SECRET_NAME)),
        finalizers: Vec::new(),
    });
    client.insert_bucket(BucketRecord {
        name: BUCKET_NAME.to_string(),
        protocol: Protocol::S3(S3 {
            endpoint: "https://s3.example.com".to_string(),
            bucket_name: "photos".to_string(),
            region: "eu-west-1".to_string(),
            signature_version: "S3V4".to_string(),
        })
        .into(),
        bucket_available: true,
    });
    client.insert_secret(
        SECRET_NAMESPACE,
        SECRET_NAME,
        [("accessKeyID", "AKIA"), ("accessSecretKey", "s3cr3t")]
            .into_iter()
            .collect(),
    );
    client
}

// ============================================================================
// MemoryFileSystem
// ============================================================================

/// Filesystem operation selector for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    CreateDir,
    Write,
    Read,
    Remove,
}

#[derive(Default)]
struct Tree {
    dirs: BTreeMap<PathBuf, u32>,
    files: BTreeMap<PathBuf, (Vec<u8>, u32)>,
    failures: Vec<(FsOp, String)>,
}

impl Tree {
    fn exists(&self, path: &Path) -> bool {
        path == Path::new("/") || self.dirs.contains_key(path) || self.files.contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        path == Path::new("/") || self.dirs.contains_key(path)
    }

    fn check(&self, op: FsOp, path: &Path) -> io::Result<()> {
        let injected = self
            .failures
            .iter()
            .any(|(o, suffix)| *o == op && path.to_string_lossy().ends_with(suffix.as_str()));
        if injected {
            return Err(io::Error::other(format!(
                "injected {:?} failure on {}",
                op,
                path.display()
            )));
        }
        Ok(())
    }
}

fn not_found_path(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: no such file or directory", path.display()),
    )
}

/// [`FileSystem`] over an in-memory tree. Paths are used verbatim, so tests
/// should pass absolute, normalized paths.
#[derive(Default)]
pub struct MemoryFileSystem {
    tree: Mutex<Tree>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail on every path ending with `suffix`.
    pub fn fail(&self, op: FsOp, suffix: &str) {
        lock(&self.tree).failures.push((op, suffix.to_string()));
    }

    pub fn clear_failures(&self) {
        lock(&self.tree).failures.clear();
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        lock(&self.tree)
            .files
            .get(path.as_ref())
            .map(|(data, _)| data.clone())
    }

    pub fn file_mode(&self, path: impl AsRef<Path>) -> Option<u32> {
        lock(&self.tree)
            .files
            .get(path.as_ref())
            .map(|(_, mode)| *mode)
    }

    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        lock(&self.tree).is_dir(path.as_ref())
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        lock(&self.tree).exists(path.as_ref())
    }
}

impl FileSystem for MemoryFileSystem {
    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut tree = lock(&self.tree);
        tree.check(FsOp::CreateDir, path)?;
        for dir in path.ancestors() {
            if dir.as_os_str().is_empty() || dir == Path::new("/") {
                continue;
            }
            if tree.files.contains_key(dir) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} is a file", dir.display()),
                ));
            }
            tree.dirs.entry(dir.to_path_buf()).or_insert(mode);
        }
        Ok(())
    }

    fn write_new(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        let mut tree = lock(&self.tree);
        tree.check(FsOp::Write, path)?;
        let parent = path.parent().ok_or_else(|| not_found_path(path))?;
        if !tree.is_dir(parent) {
            return Err(not_found_path(parent));
        }
        if tree.exists(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            ));
        }
        tree.files
            .insert(path.to_path_buf(), (data.to_vec(), mode));
        Ok(())
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let tree = lock(&self.tree);
        tree.check(FsOp::Read, path)?;
        tree.files
            .get(path)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| not_found_path(path))
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        let mut tree = lock(&self.tree);
        tree.check(FsOp::Remove, path)?;
        if !tree.dirs.contains_key(path) {
            return Err(not_found_path(path));
        }
        let has_children = tree.dirs.keys().any(|d| d != path && d.starts_with(path))
            || tree.files.keys().any(|f| f.starts_with(path));
        if has_children {
            return Err(io::Error::new(
                io::ErrorKind::DirectoryNotEmpty,
                format!("{}: directory not empty", path.display()),
            ));
        }
        tree.dirs.remove(path);
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut tree = lock(&self.tree);
        tree.check(FsOp::Remove, path)?;
        if !tree.dirs.contains_key(path) {
            return Err(not_found_path(path));
        }
        tree.dirs.retain(|d, _| !d.starts_with(path));
        tree.files.retain(|f, _| !f.starts_with(path));
        Ok(())
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(lock(&self.tree).exists(path))
    }
}

// ============================================================================
// FakeMounter
// ============================================================================

/// [`Mounter`] keeping a mount table in memory.
///
/// Path existence is checked against the filesystem it is constructed with,
/// so it pairs with either [`MemoryFileSystem`] or the host filesystem.
pub struct FakeMounter {
    fs: Arc<dyn FileSystem>,
    mounts: Mutex<BTreeMap<PathBuf, PathBuf>>,
    fail_mount: AtomicBool,
    fail_unmount: AtomicBool,
}

impl FakeMounter {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            mounts: Mutex::new(BTreeMap::new()),
            fail_mount: AtomicBool::new(false),
            fail_unmount: AtomicBool::new(false),
        }
    }

    pub fn fail_mount(&self, fail: bool) {
        self.fail_mount.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unmount(&self, fail: bool) {
        self.fail_unmount.store(fail, Ordering::SeqCst);
    }

    /// Bind source currently mounted at `target`.
    pub fn source_of(&self, target: impl AsRef<Path>) -> Option<PathBuf> {
        lock(&self.mounts).get(target.as_ref()).cloned()
    }

    pub fn mount_count(&self) -> usize {
        lock(&self.mounts).len()
    }
}

impl Mounter for FakeMounter {
    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        if !self.fs.exists(path)? {
            return Err(not_found_path(path));
        }
        Ok(lock(&self.mounts).contains_key(path))
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> io::Result<()> {
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected mount failure"));
        }
        if !self.fs.exists(source)? {
            return Err(not_found_path(source));
        }
        if !self.fs.exists(target)? {
            return Err(not_found_path(target));
        }
        lock(&self.mounts).insert(target.to_path_buf(), source.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected unmount failure"));
        }
        lock(&self.mounts).remove(target);
        Ok(())
    }
}

// ============================================================================
// RecordingEventPublisher
// ============================================================================

/// An event captured by [`RecordingEventPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub namespace: String,
    pub name: String,
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

/// [`EventPublisher`] that keeps every event in memory.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        lock(&self.events).iter().map(|e| e.reason.clone()).collect()
    }

    pub fn warnings(&self) -> BTreeSet<String> {
        lock(&self.events)
            .iter()
            .filter(|e| e.warning)
            .map(|e| e.reason.clone())
            .collect()
    }
}

#[tonic::async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        lock(&self.events).push(RecordedEvent {
            namespace: resource_ref.namespace.clone().unwrap_or_default(),
            name: resource_ref.name.clone().unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}
