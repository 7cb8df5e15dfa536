use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::sync::Arc;

use chrono::Utc;
use csv::{ReaderBuilder, Trim, WriterBuilder};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::model::{Coordinate, CoordinateRecord, DistrictName};

const SNAPSHOT_HEADER: [&str; 3] = ["departamento_nombre", "lat", "lon"];
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);
const STALE_LOCK_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRow {
    #[serde(alias = "name", alias = "district")]
    departamento_nombre: String,
    #[serde(alias = "latitude")]
    lat: f64,
    #[serde(alias = "longitude", alias = "lng")]
    lon: f64,
}

/// CSV snapshot of every known district coordinate.
///
/// Each save rewrites the whole file through a temp file and a rename, so a
/// reader only ever observes a complete snapshot. Writers from different
/// processes are serialized with a `<snapshot>.lock` file and merge what the
/// other writer persisted before replacing the snapshot.
#[derive(Clone)]
pub struct CoordinateStore {
    path: PathBuf,
    lock_timeout: Duration,
    #[cfg(test)]
    fault_injector: Option<Arc<TestFaultInjector>>,
}

impl CoordinateStore {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
            #[cfg(test)]
            fault_injector: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the snapshot. A missing file is an empty snapshot; bad contents
    /// are `CorruptStore`; failing to read the bytes at all is `Io`.
    pub fn load(&self) -> AppResult<Vec<CoordinateRecord>> {
        #[cfg(test)]
        if self
            .fault_injector
            .as_ref()
            .map(|hooks| hooks.take_read_failure())
            .unwrap_or(false)
        {
            return Err(AppError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "simulated unreadable snapshot",
            )));
        }

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no coordinate snapshot yet");
                return Ok(Vec::new());
            }
            Err(err) => return Err(AppError::Io(err)),
        };

        let mut reader = ReaderBuilder::new().trim(Trim::Headers).from_reader(file);
        let headers = reader
            .headers()
            .map_err(|err| self.read_error(err, "unreadable header".into()))?;
        if headers.iter().all(|field| field.trim().is_empty()) {
            return Err(self.corrupt("missing header row"));
        }

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for (index, row) in reader.deserialize::<SnapshotRow>().enumerate() {
            let line = index + 2;
            let row = row.map_err(|err| self.read_error(err, format!("line {line}")))?;
            let name = DistrictName::new(row.departamento_nombre)
                .map_err(|err| self.corrupt(format!("line {line}: {err}")))?;
            let coordinate = Coordinate::new(row.lat, row.lon)
                .map_err(|err| self.corrupt(format!("line {line}: {err}")))?;
            if !seen.insert(name.clone()) {
                return Err(self.corrupt(format!("line {line}: duplicate district {name}")));
            }
            records.push(CoordinateRecord::cached(name, coordinate));
        }

        debug!(
            path = %self.path.display(),
            records = records.len(),
            "coordinate snapshot loaded"
        );
        Ok(records)
    }

    pub fn save(&self, records: &[CoordinateRecord]) -> AppResult<()> {
        let dir = self.parent_dir();
        fs::create_dir_all(&dir).map_err(|err| self.persistence(err))?;
        let _lock = self.acquire_lock()?;

        let mut snapshot: BTreeMap<DistrictName, Coordinate> = records
            .iter()
            .map(|record| (record.name.clone(), record.coordinate))
            .collect();

        // An unreadable snapshot is never replaced; a corrupt one is moved aside.
        match self.load() {
            Ok(on_disk) => {
                let mut merged = 0;
                for record in on_disk {
                    if let Entry::Vacant(slot) = snapshot.entry(record.name) {
                        slot.insert(record.coordinate);
                        merged += 1;
                    }
                }
                if merged > 0 {
                    debug!(merged, "kept records persisted by another writer");
                }
            }
            Err(err) if err.is_corrupt_store() => {
                warn!(%err, "snapshot turned corrupt before save");
                self.quarantine().map_err(|err| match err {
                    AppError::Io(source) => self.persistence(source),
                    other => self.persistence(io::Error::other(other.to_string())),
                })?;
            }
            Err(AppError::Io(source)) => return Err(self.persistence(source)),
            Err(other) => return Err(self.persistence(io::Error::other(other.to_string()))),
        }

        self.write_snapshot(&dir, &snapshot)?;
        info!(
            path = %self.path.display(),
            records = snapshot.len(),
            "coordinate snapshot saved"
        );
        Ok(())
    }

    /// Moves a corrupt snapshot aside so the next save does not overwrite it.
    pub fn quarantine(&self) -> AppResult<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "coordinates.csv".into());
        let target = self.path.with_file_name(format!(
            "{file_name}.corrupt-{}",
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        fs::rename(&self.path, &target)?;
        warn!(
            path = %self.path.display(),
            quarantined = %target.display(),
            "moved corrupt coordinate snapshot aside"
        );
        Ok(Some(target))
    }

    fn write_snapshot(
        &self,
        dir: &Path,
        snapshot: &BTreeMap<DistrictName, Coordinate>,
    ) -> AppResult<()> {
        #[cfg(test)]
        if self
            .fault_injector
            .as_ref()
            .map(|hooks| hooks.take_disk_full())
            .unwrap_or(false)
        {
            return Err(self.persistence(io::Error::new(
                io::ErrorKind::WriteZero,
                "simulated disk full",
            )));
        }

        let mut temp = NamedTempFile::new_in(dir).map_err(|err| self.persistence(err))?;
        {
            let mut writer = WriterBuilder::new()
                .has_headers(false)
                .from_writer(temp.as_file_mut());
            writer
                .write_record(SNAPSHOT_HEADER)
                .map_err(|err| self.persistence(err.into()))?;
            for (name, coordinate) in snapshot {
                writer
                    .serialize(SnapshotRow {
                        departamento_nombre: name.as_str().to_string(),
                        lat: coordinate.lat(),
                        lon: coordinate.lon(),
                    })
                    .map_err(|err| self.persistence(err.into()))?;
            }
            writer.flush().map_err(|err| self.persistence(err))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|err| self.persistence(err))?;
        temp.persist(&self.path)
            .map_err(|err| self.persistence(err.error))?;
        Ok(())
    }

    fn acquire_lock(&self) -> AppResult<SnapshotLock> {
        let lock_path = self.lock_path();
        let started = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    if let Err(err) = writeln!(file, "{}", std::process::id()) {
                        debug!(?err, "unable to record lock owner");
                    }
                    return Ok(SnapshotLock { path: lock_path });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&lock_path) {
                        warn!(lock = %lock_path.display(), "removing stale snapshot lock");
                        if let Err(err) = fs::remove_file(&lock_path) {
                            debug!(?err, "stale lock already gone");
                        }
                        continue;
                    }
                    if started.elapsed() >= self.lock_timeout {
                        return Err(self.persistence(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("snapshot lock {} is held by another writer", lock_path.display()),
                        )));
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => return Err(self.persistence(err)),
            }
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn parent_dir(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn read_error(&self, err: csv::Error, context: String) -> AppError {
        if !err.is_io_error() {
            return self.corrupt(format!("{context}: {err}"));
        }
        match err.into_kind() {
            csv::ErrorKind::Io(source) => AppError::Io(source),
            kind => self.corrupt(format!("{context}: {kind:?}")),
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> AppError {
        AppError::CorruptStore {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn persistence(&self, source: io::Error) -> AppError {
        AppError::Persistence {
            path: self.path.clone(),
            source,
        }
    }
}

struct SnapshotLock {
    path: PathBuf,
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(?err, lock = %self.path.display(), "failed to release snapshot lock");
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > STALE_LOCK_AFTER)
        .unwrap_or(false)
}

#[cfg(test)]
#[derive(Default)]
pub struct TestFaultInjector {
    disk_full: AtomicBool,
    read_failure: AtomicBool,
}

#[cfg(test)]
impl TestFaultInjector {
    pub fn fail_next_disk_full(&self) {
        self.disk_full.store(true, Ordering::SeqCst);
    }

    fn take_disk_full(&self) -> bool {
        self.disk_full.swap(false, Ordering::SeqCst)
    }

    pub fn fail_next_read(&self) {
        self.read_failure.store(true, Ordering::SeqCst);
    }

    fn take_read_failure(&self) -> bool {
        self.read_failure.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
impl CoordinateStore {
    pub fn enable_test_hooks(&mut self) -> Arc<TestFaultInjector> {
        let hooks = Arc::new(TestFaultInjector::default());
        self.fault_injector = Some(hooks.clone());
        hooks
    }
}
