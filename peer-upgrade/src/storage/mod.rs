//! Content-addressed installer storage.
//!
//! Layout under the storage directory:
//!
//! ```text
//! <hash>.apk     verified installer bytes
//! <hash>.json    package metadata recorded when the installer was accepted
//! tmp/           in-progress writes, wiped on start
//! ```
//!
//! Nothing reaches `<hash>.apk` until its bytes have hashed to `<hash>` and the
//! validator has accepted them. By default that means opening the package and
//! reading its manifest. The device's own installer is registered by
//! path and never copied in.

mod apk;
mod validator;
mod writer;

pub use apk::ApkValidator;
pub use validator::{DeclaredMetadataValidator, InstallerValidator};
pub use writer::{InstallerWriter, WriteRequest};

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use peer_upgrade_core::{
    hash_reader, is_valid_hash, precedence, short_hash, InstallerDescriptor, PackageInfo,
};
use semver::Version;
use tokio::fs;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::Notifier;

pub const TEMP_DIR: &str = "tmp";
pub const DEFAULT_PLATFORM: &str = "android";
pub const DEFAULT_ARCH: &str = "arm64-v8a";

const INSTALLER_EXT: &str = "apk";
const METADATA_EXT: &str = "json";

/// Installer bytes as an async stream of chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[derive(Clone)]
pub struct StoreOptions {
    pub storage_dir: PathBuf,
    /// Version the device runs; anything strictly older is swept.
    pub current_version: Version,
    pub platform: String,
    pub arch: Vec<String>,
    pub validator: Arc<dyn InstallerValidator>,
}

impl StoreOptions {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            current_version: Version::new(0, 0, 0),
            platform: DEFAULT_PLATFORM.to_string(),
            arch: vec![DEFAULT_ARCH.to_string()],
            validator: Arc::new(ApkValidator),
        }
    }

    pub fn with_current_version(mut self, version: Version) -> Self {
        self.current_version = version;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>, arch: Vec<String>) -> Self {
        self.platform = platform.into();
        self.arch = arch;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn InstallerValidator>) -> Self {
        self.validator = validator;
        self
    }
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("storage_dir", &self.storage_dir)
            .field("current_version", &self.current_version)
            .field("platform", &self.platform)
            .field("arch", &self.arch)
            .finish_non_exhaustive()
    }
}

/// The installer this device runs, registered by path.
#[derive(Debug, Clone)]
struct CurrentInstaller {
    path: PathBuf,
    descriptor: InstallerDescriptor,
}

#[derive(Debug)]
struct StoreState {
    current_version: Version,
    current: Option<CurrentInstaller>,
    installers: BTreeMap<String, InstallerDescriptor>,
}

impl StoreState {
    fn listing(&self) -> Vec<InstallerDescriptor> {
        let own = self.current.as_ref().map(|c| &c.descriptor);
        own.into_iter()
            .chain(
                self.installers
                    .values()
                    .filter(|d| own.map_or(true, |o| o.hash != d.hash)),
            )
            .cloned()
            .collect()
    }
}

struct StoreInner {
    dir: PathBuf,
    tmp_dir: PathBuf,
    platform: String,
    arch: Vec<String>,
    validator: Arc<dyn InstallerValidator>,
    state: Mutex<StoreState>,
    started: OnceCell<()>,
    changed: Notifier<Vec<InstallerDescriptor>>,
}

/// Cheap to clone; clones share one store.
#[derive(Clone)]
pub struct InstallerStore {
    inner: Arc<StoreInner>,
}

impl InstallerStore {
    pub fn new(options: StoreOptions) -> Self {
        let tmp_dir = options.storage_dir.join(TEMP_DIR);
        Self {
            inner: Arc::new(StoreInner {
                dir: options.storage_dir,
                tmp_dir,
                platform: options.platform,
                arch: options.arch,
                validator: options.validator,
                state: Mutex::new(StoreState {
                    current_version: options.current_version,
                    current: None,
                    installers: BTreeMap::new(),
                }),
                started: OnceCell::new(),
                changed: Notifier::new(),
            }),
        }
    }

    /// Prepare the directory, wipe leftovers from interrupted writes, load
    /// verified installers and sweep old ones. Safe to call more than once.
    pub async fn start(&self) -> Result<()> {
        self.inner
            .started
            .get_or_try_init(|| self.recover())
            .await?;
        Ok(())
    }

    async fn recover(&self) -> Result<()> {
        fs::create_dir_all(&self.inner.tmp_dir).await?;
        let wiped = wipe_dir(&self.inner.tmp_dir).await?;
        if wiped > 0 {
            info!(wiped, "removed leftover temporary files");
        }
        let found = self.scan().await?;
        info!(
            dir = %self.inner.dir.display(),
            installers = found.len(),
            "installer store ready"
        );
        self.inner.state.lock().installers = found;
        if self.clear_old_apks().await?.is_empty() {
            self.emit_changed();
        }
        Ok(())
    }

    /// Verified installers already on disk. Anything that fails verification
    /// is skipped and left where it is.
    async fn scan(&self) -> Result<BTreeMap<String, InstallerDescriptor>> {
        let mut found = BTreeMap::new();
        let mut entries = fs::read_dir(&self.inner.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension() != Some(OsStr::new(INSTALLER_EXT)) {
                continue;
            }
            let Some(hash) = path.file_stem().and_then(OsStr::to_str) else {
                continue;
            };
            if !is_valid_hash(hash) {
                debug!(path = %path.display(), "ignoring file with non-hash name");
                continue;
            }
            match self.load_stored(hash).await {
                Ok(descriptor) => {
                    found.insert(hash.to_string(), descriptor);
                }
                Err(e) => {
                    warn!(hash = short_hash(hash), error = %e, "ignoring stored installer");
                }
            }
        }
        Ok(found)
    }

    async fn load_stored(&self, hash: &str) -> Result<InstallerDescriptor> {
        let raw = fs::read(self.metadata_path(hash)).await?;
        let declared: PackageInfo = serde_json::from_slice(&raw)
            .map_err(|e| Error::InvalidInstaller(format!("unreadable metadata: {e}")))?;
        let info = self
            .verify_file(self.installer_path(hash), hash.to_string(), Some(declared))
            .await?;
        Ok(InstallerDescriptor::new(hash, info))
    }

    /// Hash the file at `path`, compare with `expected`, then validate it.
    pub(crate) async fn verify_file(
        &self,
        path: PathBuf,
        expected: String,
        declared: Option<PackageInfo>,
    ) -> Result<PackageInfo> {
        let validator = self.inner.validator.clone();
        tokio::task::spawn_blocking(move || {
            let (actual, _) = hash_reader(std::fs::File::open(&path)?)?;
            if actual != expected {
                return Err(Error::HashMismatch { expected, actual });
            }
            validator.validate(&path, declared.as_ref())
        })
        .await
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    /// The device's own installer (if registered) followed by every stored one.
    pub fn list(&self) -> Vec<InstallerDescriptor> {
        self.inner.state.lock().listing()
    }

    pub fn get(&self, hash: &str) -> Option<InstallerDescriptor> {
        let state = self.inner.state.lock();
        match &state.current {
            Some(c) if c.descriptor.hash == hash => Some(c.descriptor.clone()),
            _ => state.installers.get(hash).cloned(),
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.get(hash).is_some()
    }

    /// Hashes available locally, own installer included.
    pub fn hashes(&self) -> HashSet<String> {
        self.list().into_iter().map(|d| d.hash).collect()
    }

    pub fn current_version(&self) -> Version {
        self.inner.state.lock().current_version.clone()
    }

    pub fn platform(&self) -> &str {
        &self.inner.platform
    }

    pub fn arch(&self) -> &[String] {
        &self.inner.arch
    }

    pub fn storage_dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Notified with the full list whenever it changes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<InstallerDescriptor>> {
        self.inner.changed.subscribe()
    }

    /// Register the installer this device runs. It is hashed in place, served
    /// from `path`, and its version becomes the sweep threshold.
    pub async fn set_apk_info(
        &self,
        path: impl Into<PathBuf>,
        version: Version,
    ) -> Result<InstallerDescriptor> {
        self.start().await?;
        let path = path.into();
        let source = path.clone();
        let (hash, size) =
            tokio::task::spawn_blocking(move || hash_reader(std::fs::File::open(&source)?))
                .await
                .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        let descriptor = InstallerDescriptor::new(
            hash,
            PackageInfo {
                version: version.clone(),
                size,
                platform: self.inner.platform.clone(),
                arch: self.inner.arch.clone(),
            },
        );
        {
            let mut state = self.inner.state.lock();
            state.current_version = version;
            state.current = Some(CurrentInstaller {
                path,
                descriptor: descriptor.clone(),
            });
        }
        info!(installer = %descriptor, "registered own installer");
        if self.clear_old_apks().await?.is_empty() {
            self.emit_changed();
        }
        Ok(descriptor)
    }

    /// Open a sink for an installer expected to hash to `request.hash`.
    pub async fn create_write_stream(&self, request: WriteRequest) -> Result<InstallerWriter> {
        self.start().await?;
        let tmp_path = self.inner.tmp_dir.join(Uuid::new_v4().to_string());
        let file = fs::File::create(&tmp_path).await?;
        debug!(hash = short_hash(&request.hash), "receiving installer");
        Ok(InstallerWriter::new(self.clone(), request, tmp_path, file))
    }

    /// Stream a stored installer or the device's own. Unknown hashes yield a
    /// single `NotFound` error.
    pub fn create_read_stream(&self, hash: &str) -> ByteStream {
        match self.path_for(hash) {
            Some(path) => file_stream(path),
            None => not_found_stream(hash),
        }
    }

    fn path_for(&self, hash: &str) -> Option<PathBuf> {
        let state = self.inner.state.lock();
        match &state.current {
            Some(c) if c.descriptor.hash == hash => Some(c.path.clone()),
            _ if state.installers.contains_key(hash) => Some(self.installer_path(hash)),
            _ => None,
        }
    }

    /// Remove stored installers strictly older than the current version.
    /// The device's own installer is never removed.
    ///
    /// An installer stays listed until its file is actually gone; the first
    /// deletion failure is returned after the others have been attempted.
    pub async fn clear_old_apks(&self) -> Result<Vec<InstallerDescriptor>> {
        let stale: Vec<InstallerDescriptor> = {
            let state = self.inner.state.lock();
            let own = state.current.as_ref().map(|c| c.descriptor.hash.as_str());
            let stale: Vec<InstallerDescriptor> = state
                .installers
                .values()
                .filter(|d| own != Some(d.hash.as_str()))
                .filter(|d| precedence(&d.version, &state.current_version) == Ordering::Less)
                .cloned()
                .collect();
            stale
        };
        if stale.is_empty() {
            return Ok(stale);
        }
        let mut removed = Vec::with_capacity(stale.len());
        let mut failure = None;
        for installer in stale {
            if let Err(e) = remove_if_exists(&self.installer_path(&installer.hash)).await {
                warn!(installer = %installer, error = %e, "failed to remove old installer");
                failure.get_or_insert(e);
                continue;
            }
            if let Err(e) = remove_if_exists(&self.metadata_path(&installer.hash)).await {
                warn!(
                    hash = short_hash(&installer.hash),
                    error = %e,
                    "failed to remove metadata"
                );
            }
            debug!(installer = %installer, "removed old installer");
            removed.push(installer);
        }
        if !removed.is_empty() {
            let mut state = self.inner.state.lock();
            for installer in &removed {
                state.installers.remove(&installer.hash);
            }
            info!(
                removed = removed.len(),
                current = %state.current_version,
                "cleared old installers"
            );
            self.inner.changed.emit(state.listing());
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(removed),
        }
    }

    /// Move a verified temp file into place. Already-stored hashes are left
    /// untouched and the temp file is discarded.
    pub(crate) async fn promote(
        &self,
        hash: &str,
        info: PackageInfo,
        tmp_path: &Path,
    ) -> Result<InstallerDescriptor> {
        if let Some(existing) = self.get(hash) {
            remove_if_exists(tmp_path).await?;
            debug!(installer = %existing, "installer already stored");
            return Ok(existing);
        }
        let descriptor = InstallerDescriptor::new(hash, info);
        let record = serde_json::to_vec_pretty(&descriptor.package_info())
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let record_tmp = self
            .inner
            .tmp_dir
            .join(format!("{}.{}", Uuid::new_v4(), METADATA_EXT));
        fs::write(&record_tmp, record).await?;
        let metadata_path = self.metadata_path(hash);
        if let Err(e) = fs::rename(&record_tmp, &metadata_path).await {
            let _ = remove_if_exists(&record_tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(tmp_path, self.installer_path(hash)).await {
            if let Err(cleanup) = remove_if_exists(&metadata_path).await {
                warn!(
                    hash = short_hash(hash),
                    error = %cleanup,
                    "failed to remove orphaned metadata"
                );
            }
            return Err(e.into());
        }
        let mut state = self.inner.state.lock();
        state.installers.insert(hash.to_string(), descriptor.clone());
        info!(installer = %descriptor, "stored installer");
        self.inner.changed.emit(state.listing());
        Ok(descriptor)
    }

    fn installer_path(&self, hash: &str) -> PathBuf {
        self.inner.dir.join(format!("{hash}.{INSTALLER_EXT}"))
    }

    fn metadata_path(&self, hash: &str) -> PathBuf {
        self.inner.dir.join(format!("{hash}.{METADATA_EXT}"))
    }

    /// Snapshot and send under the state lock so subscribers see lists in
    /// the order the changes were made.
    fn emit_changed(&self) {
        let state = self.inner.state.lock();
        self.inner.changed.emit(state.listing());
    }
}

impl fmt::Debug for InstallerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallerStore")
            .field("dir", &self.inner.dir)
            .finish_non_exhaustive()
    }
}

pub(crate) fn not_found_stream(hash: &str) -> ByteStream {
    stream::once(futures::future::ready(Err(Error::NotFound(hash.to_string())))).boxed()
}

fn file_stream(path: PathBuf) -> ByteStream {
    stream::once(fs::File::open(path))
        .map_ok(ReaderStream::new)
        .try_flatten()
        .map_err(Error::from)
        .boxed()
}

pub(crate) async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn wipe_dir(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(entry.path()).await?;
        } else {
            fs::remove_file(entry.path()).await?;
        }
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_upgrade_core::hash_bytes;
    use rand::RngCore;
    use tempfile::TempDir;

    const FAKE_APK: &[u8] = b"fake data\n";
    const FAKE_HASH: &str = "78ad74cecb99d1023206bf2f7d9b11b28767fbb9369daa0afa5e4d062c7ce041";

    fn declared(version: &str, size: usize) -> PackageInfo {
        PackageInfo {
            version: Version::parse(version).unwrap(),
            size: size as u64,
            platform: DEFAULT_PLATFORM.to_string(),
            arch: vec![DEFAULT_ARCH.to_string()],
        }
    }

    /// Store over synthetic payloads: declared metadata is trusted.
    async fn open_store(dir: &Path, current: &str) -> InstallerStore {
        let store = InstallerStore::new(
            StoreOptions::new(dir)
                .with_current_version(Version::parse(current).unwrap())
                .with_validator(Arc::new(DeclaredMetadataValidator)),
        );
        store.start().await.unwrap();
        store
    }

    /// Store with the default validator, which opens the package.
    async fn open_apk_store(dir: &Path, current: &str) -> InstallerStore {
        let store = InstallerStore::new(
            StoreOptions::new(dir).with_current_version(Version::parse(current).unwrap()),
        );
        store.start().await.unwrap();
        store
    }

    async fn put(store: &InstallerStore, bytes: &[u8], version: &str) -> Result<InstallerDescriptor> {
        let request =
            WriteRequest::new(hash_bytes(bytes)).with_declared(declared(version, bytes.len()));
        let mut writer = store.create_write_stream(request).await?;
        writer.write(bytes).await?;
        writer.finish().await
    }

    async fn read_all(stream: ByteStream) -> Result<Vec<u8>> {
        let chunks: Vec<Bytes> = stream.try_collect().await?;
        Ok(chunks.concat())
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut out: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn fresh_store_is_empty_with_temp_area() {
        let temp = TempDir::new().unwrap();
        let store = InstallerStore::new(StoreOptions::new(temp.path()));
        let mut rx = store.subscribe();
        store.start().await.unwrap();
        store.start().await.unwrap();

        assert!(store.list().is_empty());
        assert_eq!(names(temp.path()), vec![TEMP_DIR]);
        assert_eq!(rx.recv().await, Some(Vec::new()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn own_installer_is_listed_and_served_from_its_path() {
        let temp = TempDir::new().unwrap();
        let apk = temp.path().join("base.apk");
        std::fs::write(&apk, FAKE_APK).unwrap();
        let store = open_store(&temp.path().join("store"), "0.0.0").await;

        let own = store
            .set_apk_info(&apk, Version::new(1, 2, 3))
            .await
            .unwrap();
        assert_eq!(
            own,
            InstallerDescriptor::new(FAKE_HASH, declared("1.2.3", FAKE_APK.len()))
        );
        assert_eq!(store.list(), vec![own]);
        assert_eq!(store.current_version(), Version::new(1, 2, 3));
        assert_eq!(
            read_all(store.create_read_stream(FAKE_HASH)).await.unwrap(),
            FAKE_APK
        );
        assert_eq!(names(&temp.path().join("store")), vec![TEMP_DIR]);
    }

    #[tokio::test]
    async fn verified_write_is_promoted() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "1.0.0").await;
        let mut rx = store.subscribe();

        let stored = put(&store, b"testdata", "3.0.0").await.unwrap();
        let hash = "810ff2fb242a5dee4220f2cb0e6a519891fb67f2f828a6cab4ef8894633b1f50";
        assert_eq!(stored.hash, hash);
        assert_eq!(store.list(), vec![stored.clone()]);
        assert_eq!(rx.recv().await, Some(vec![stored]));
        assert_eq!(
            names(temp.path()),
            vec![format!("{hash}.apk"), format!("{hash}.json"), TEMP_DIR.to_string()]
        );
        assert!(names(&temp.path().join(TEMP_DIR)).is_empty());
        assert_eq!(
            read_all(store.create_read_stream(hash)).await.unwrap(),
            b"testdata"
        );
    }

    #[tokio::test]
    async fn hash_mismatch_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "0.0.0").await;

        let request = WriteRequest::new("invalid-hash").with_declared(declared("1.0.0", 8));
        let mut writer = store.create_write_stream(request).await.unwrap();
        writer.write(b"testdata").await.unwrap();
        let err = writer.finish().await.unwrap_err();

        assert!(matches!(err, Error::HashMismatch { .. }));
        assert!(store.list().is_empty());
        assert_eq!(names(temp.path()), vec![TEMP_DIR]);
        assert!(names(&temp.path().join(TEMP_DIR)).is_empty());
    }

    #[tokio::test]
    async fn invalid_package_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "0.0.0").await;

        let request = WriteRequest::new(hash_bytes(b"testdata")).with_declared(declared("1.0.0", 99));
        let mut writer = store.create_write_stream(request).await.unwrap();
        writer.write(b"testdata").await.unwrap();
        let err = writer.finish().await.unwrap_err();

        assert!(matches!(err, Error::InvalidInstaller(_)));
        assert!(store.list().is_empty());
        assert!(names(&temp.path().join(TEMP_DIR)).is_empty());
    }

    #[tokio::test]
    async fn dropped_writer_removes_temp_file() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "0.0.0").await;
        let mut writer = store
            .create_write_stream(WriteRequest::new(hash_bytes(b"testdata")))
            .await
            .unwrap();
        writer.write(b"test").await.unwrap();
        drop(writer);
        assert!(names(&temp.path().join(TEMP_DIR)).is_empty());
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn storing_same_bytes_twice_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "0.0.0").await;
        let first = put(&store, b"testdata", "1.0.0").await.unwrap();
        let second = put(&store, b"testdata", "1.0.0").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list().len(), 1);
        assert_eq!(names(temp.path()).len(), 3);
    }

    #[tokio::test]
    async fn sweep_removes_everything_older_than_current() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "4.0.0").await;
        put(&store, b"one", "1.0.0").await.unwrap();
        put(&store, b"three", "3.0.0").await.unwrap();

        let removed = store.clear_old_apks().await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.list().is_empty());
        assert_eq!(names(temp.path()), vec![TEMP_DIR]);
    }

    #[tokio::test]
    async fn sweep_keeps_equal_and_newer() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "1.0.0").await;
        let old = put(&store, b"old", "0.9.0").await.unwrap();
        let same = put(&store, b"same", "1.0.0").await.unwrap();
        let newer = put(&store, b"newer", "3.0.0").await.unwrap();

        let removed = store.clear_old_apks().await.unwrap();
        assert_eq!(removed, vec![old]);
        let left = store.hashes();
        assert!(left.contains(&same.hash));
        assert!(left.contains(&newer.hash));
        assert_eq!(left.len(), 2);
    }

    #[tokio::test]
    async fn registering_newer_own_installer_sweeps_older() {
        let temp = TempDir::new().unwrap();
        let apk = temp.path().join("base.apk");
        std::fs::write(&apk, FAKE_APK).unwrap();
        let store = open_store(&temp.path().join("store"), "0.0.0").await;
        put(&store, b"testdata", "1.0.0").await.unwrap();

        store
            .set_apk_info(&apk, Version::new(2, 0, 0))
            .await
            .unwrap();
        let hashes: Vec<String> = store.list().into_iter().map(|d| d.hash).collect();
        assert_eq!(hashes, vec![FAKE_HASH.to_string()]);
    }

    #[tokio::test]
    async fn restart_reloads_verified_installers_and_wipes_temp() {
        let temp = TempDir::new().unwrap();
        let stored = {
            let store = open_store(temp.path(), "0.0.0").await;
            put(&store, b"testdata", "1.0.0").await.unwrap()
        };
        std::fs::write(temp.path().join(TEMP_DIR).join("partial"), b"half").unwrap();

        let store = open_store(temp.path(), "0.5.0").await;
        assert_eq!(store.list(), vec![stored]);
        assert!(names(&temp.path().join(TEMP_DIR)).is_empty());
    }

    #[tokio::test]
    async fn restart_with_newer_version_sweeps() {
        let temp = TempDir::new().unwrap();
        {
            let store = open_store(temp.path(), "0.0.0").await;
            put(&store, b"testdata", "1.0.0").await.unwrap();
        }
        let store = open_store(temp.path(), "2.0.0").await;
        assert!(store.list().is_empty());
        assert_eq!(names(temp.path()), vec![TEMP_DIR]);
    }

    #[tokio::test]
    async fn corrupt_files_on_disk_are_ignored_not_deleted() {
        let temp = TempDir::new().unwrap();
        let forged = temp.path().join(format!("{FAKE_HASH}.apk"));
        std::fs::write(&forged, b"not the right bytes").unwrap();
        std::fs::write(
            temp.path().join(format!("{FAKE_HASH}.json")),
            serde_json::to_vec(&declared("1.0.0", 19)).unwrap(),
        )
        .unwrap();

        let store = open_store(temp.path(), "0.0.0").await;
        assert!(store.list().is_empty());
        assert!(forged.exists());
    }

    #[tokio::test]
    async fn unknown_hash_reads_as_not_found() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "0.0.0").await;
        let err = read_all(store.create_read_stream(FAKE_HASH))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
    #[tokio::test]
    async fn package_metadata_comes_from_the_package() {
        let temp = TempDir::new().unwrap();
        let store = open_apk_store(temp.path(), "1.0.0").await;
        let bytes = apk::fixture::apk("2.0.0", &["arm64-v8a"]);

        let mut writer = store
            .create_write_stream(WriteRequest::new(hash_bytes(&bytes)))
            .await
            .unwrap();
        writer.write(&bytes).await.unwrap();
        let stored = writer.finish().await.unwrap();

        assert_eq!(stored.version, Version::new(2, 0, 0));
        assert_eq!(stored.size, bytes.len() as u64);
        assert_eq!(stored.arch, vec![DEFAULT_ARCH.to_string()]);
        assert_eq!(store.list(), vec![stored.clone()]);

        let reopened = open_apk_store(temp.path(), "1.0.0").await;
        assert_eq!(reopened.list(), vec![stored]);
    }

    #[tokio::test]
    async fn correctly_hashed_non_package_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = open_apk_store(temp.path(), "0.0.0").await;
        let mut bytes = vec![0u8; 64 * 1024];
        rand::thread_rng().fill_bytes(&mut bytes);

        let request =
            WriteRequest::new(hash_bytes(&bytes)).with_declared(declared("99.0.0", bytes.len()));
        let mut writer = store.create_write_stream(request).await.unwrap();
        writer.write(&bytes).await.unwrap();
        let err = writer.finish().await.unwrap_err();

        assert!(matches!(err, Error::InvalidInstaller(_)));
        assert!(store.list().is_empty());
        assert_eq!(names(temp.path()), vec![TEMP_DIR]);
        assert!(names(&temp.path().join(TEMP_DIR)).is_empty());
    }

    #[tokio::test]
    async fn package_claiming_another_version_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = open_apk_store(temp.path(), "0.0.0").await;
        let bytes = apk::fixture::apk("1.0.0", &["arm64-v8a"]);

        let request =
            WriteRequest::new(hash_bytes(&bytes)).with_declared(declared("99.0.0", bytes.len()));
        let mut writer = store.create_write_stream(request).await.unwrap();
        writer.write(&bytes).await.unwrap();
        assert!(matches!(
            writer.finish().await,
            Err(Error::InvalidInstaller(_))
        ));
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn writing_past_declared_size_fails_at_once() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "0.0.0").await;
        let request = WriteRequest::new(FAKE_HASH).with_declared(declared("1.0.0", 10));
        let mut writer = store.create_write_stream(request).await.unwrap();

        writer.write(b"fake ").await.unwrap();
        let err = writer.write(&vec![0u8; 1024 * 1024]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInstaller(_)));
        assert_eq!(writer.written(), 5);
        assert!(names(&temp.path().join(TEMP_DIR)).is_empty());

        assert!(writer.write(b"data\n").await.is_err());
        assert!(writer.finish().await.is_err());
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn exactly_declared_size_is_accepted() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "0.0.0").await;
        let request = WriteRequest::new(FAKE_HASH).with_declared(declared("1.0.0", 10));
        let mut writer = store.create_write_stream(request).await.unwrap();
        writer.write(b"fake ").await.unwrap();
        writer.write(b"data\n").await.unwrap();
        assert_eq!(writer.finish().await.unwrap().hash, FAKE_HASH);
    }

    #[tokio::test]
    async fn last_change_notification_matches_final_list() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "0.0.0").await;
        let mut rx = store.subscribe();

        let payloads: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 32 + i as usize]).collect();
        let writes = payloads.iter().map(|bytes| put(&store, bytes, "1.0.0"));
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }
        store.clear_old_apks().await.unwrap();

        let mut last = None;
        while let Ok(list) = rx.try_recv() {
            last = Some(list);
        }
        let last = last.unwrap();
        assert_eq!(last.len(), payloads.len());
        assert_eq!(last, store.list());
    }

    #[tokio::test]
    async fn failed_sweep_keeps_undeleted_installer_listed() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "0.0.0").await;
        let stuck = put(&store, b"stuck", "1.0.0").await.unwrap();
        let gone = put(&store, b"gone", "1.0.0").await.unwrap();

        // A non-empty directory where the file was cannot be removed as a file.
        let path = temp.path().join(format!("{}.apk", stuck.hash));
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();

        let apk = temp.path().join("base.apk");
        std::fs::write(&apk, FAKE_APK).unwrap();
        let err = store
            .set_apk_info(&apk, Version::new(2, 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        let hashes = store.hashes();
        assert!(hashes.contains(&stuck.hash));
        assert!(!hashes.contains(&gone.hash));
        assert!(!temp.path().join(format!("{}.apk", gone.hash)).exists());
    }

    #[tokio::test]
    async fn failed_promotion_leaves_no_metadata() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "0.0.0").await;
        let hash = hash_bytes(b"testdata");
        let blocker = temp.path().join(format!("{hash}.apk"));
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();

        let err = put(&store, b"testdata", "1.0.0").await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!temp.path().join(format!("{hash}.json")).exists());
        assert!(names(&temp.path().join(TEMP_DIR)).is_empty());
        assert!(store.list().is_empty());
    }
}
