//! Periodic snapshot/restore of durable parameter values.
//!
//! A snapshot is a JSON document mapping parameter name to value, written
//! with sorted keys to a file whose name encodes the creation time, so that
//! lexicographic order equals chronological order. After every successful
//! save the directory is pruned down to the retention count, oldest first.
//!
//! Restore walks the directory newest-first. Within one file, entries whose
//! stored type does not match the declared parameter type are skipped with a
//! logged error; a file that yields at least one value is accepted as a
//! successful restore even when other entries in it failed. Only a file that
//! yields zero values (empty, unparsable, or fully invalid) triggers
//! fallback to the next-older file, so one corrupted snapshot never blocks
//! restoration of older good data.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{AppResult, CamError};
use crate::store::{ParamSpec, ParamType, ParamValue, ParameterStore};

/// Snapshot files kept after pruning.
pub const DEFAULT_RETENTION: usize = 8;
/// Interval between periodic saves.
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(5);

/// Owns the snapshot directory for one instance.
pub struct SnapshotStore {
    store: Arc<ParameterStore>,
    dir: PathBuf,
    retention: usize,
    durable: Vec<String>,
}

impl SnapshotStore {
    /// Create the store and its directory. The set of durable keys is
    /// scanned from the full catalog here and never changes afterwards.
    ///
    /// A pre-existing non-directory at the path is a fatal construction
    /// error.
    pub fn new(store: Arc<ParameterStore>, dir: PathBuf, retention: usize) -> AppResult<Self> {
        if dir.exists() && !dir.is_dir() {
            return Err(CamError::Snapshot(format!(
                "{} exists and is not a directory",
                dir.display()
            )));
        }
        fs::create_dir_all(&dir)?;
        let durable = store.tagged(|spec| spec.durable);
        debug!(count = durable.len(), dir = %dir.display(), "snapshot store initialized");
        Ok(Self {
            store,
            dir,
            retention,
            durable,
        })
    }

    /// Snapshot directory for an instance: `<root>/<name>/autosave` when an
    /// instance name is given, otherwise a local directory derived from the
    /// parameter prefix.
    pub fn directory_for(root: &Path, instance: Option<&str>, prefix: &str) -> PathBuf {
        match instance {
            Some(name) => root.join(name).join("autosave"),
            None => PathBuf::from(format!(
                "autosave_{}",
                prefix.replace(':', "_").to_lowercase()
            )),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Names included in every snapshot, sorted, fixed at construction.
    pub fn durable_keys(&self) -> &[String] {
        &self.durable
    }

    fn snapshot_name() -> String {
        // Fixed-width local timestamp keeps lexicographic == chronological.
        format!("{}.json", Local::now().format("%Y%m%d-%H%M%S%.6f"))
    }

    fn list_snapshots(&self) -> AppResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Write the current durable values to a fresh snapshot file, then prune
    /// the directory down to the retention count.
    pub async fn save(&self) -> AppResult<PathBuf> {
        let mut doc = BTreeMap::new();
        for name in &self.durable {
            if let Some(value) = self.store.get(name).await {
                doc.insert(name.clone(), value.to_json());
            }
        }
        let path = self.dir.join(Self::snapshot_name());
        let mut body = serde_json::to_string_pretty(&doc)?;
        body.push('\n');
        tokio::fs::write(&path, body).await?;
        debug!(path = %path.display(), entries = doc.len(), "snapshot written");
        self.prune()?;
        Ok(path)
    }

    fn prune(&self) -> AppResult<()> {
        let files = self.list_snapshots()?;
        if files.len() <= self.retention {
            return Ok(());
        }
        for path in &files[..files.len() - self.retention] {
            debug!(path = %path.display(), "removing old snapshot");
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Restore parameter values from the most recent usable snapshot,
    /// falling back to successively older files. Returns whether at least
    /// one value was restored; `false` leaves the catalog defaults in force.
    pub async fn restore(&self) -> bool {
        let files = match self.list_snapshots() {
            Ok(files) => files,
            Err(err) => {
                error!(%err, "cannot list snapshot directory");
                return false;
            }
        };
        for path in files.iter().rev() {
            match self.restore_file(path).await {
                Ok(count) if count > 0 => {
                    info!(
                        restored = count,
                        durable = self.durable.len(),
                        path = %path.display(),
                        "restored parameter values from snapshot"
                    );
                    return true;
                }
                Ok(_) => {
                    warn!(path = %path.display(), "no valid entries in snapshot, trying an older one")
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "unreadable snapshot, trying an older one")
                }
            }
        }
        warn!("no usable snapshot found, keeping catalog defaults");
        false
    }

    async fn restore_file(&self, path: &Path) -> AppResult<usize> {
        let body = tokio::fs::read_to_string(path).await?;
        let doc: BTreeMap<String, serde_json::Value> = serde_json::from_str(&body)?;
        let mut restored = 0;
        for (name, raw) in &doc {
            let Some(spec) = self.store.spec(name) else {
                error!(name = %name, "snapshot entry for unknown parameter, skipping");
                continue;
            };
            match decode_entry(spec, raw) {
                Ok(value) => match self.store.set(name, value).await {
                    Ok(()) => {
                        restored += 1;
                        debug!(name = %name, "snapshot restored parameter");
                    }
                    Err(err) => error!(name = %name, %err, "could not restore parameter"),
                },
                Err(err) => error!(name = %name, %err, "snapshot value has wrong type, skipping"),
            }
        }
        Ok(restored)
    }

    /// Periodic autosave task. Saves every `interval` until the shutdown
    /// channel fires, then performs one final save so shutdown persists the
    /// values current as of the last interval.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it so the first
        // save happens one full interval after startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.save().await {
                        error!(%err, "periodic snapshot failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        if let Err(err) = self.save().await {
            error!(%err, "final snapshot failed");
        }
        debug!("snapshot task exiting");
    }

    /// Write the `<name>, <record type>` listing into the instance's
    /// `iocInfo` directory, beside (never inside) the autosave data, so
    /// operators can see what this instance serves without the listing
    /// competing with snapshot retention.
    pub fn write_param_list(&self, prefix: &str) -> AppResult<PathBuf> {
        let mut lines = String::new();
        for name in self.store.names_sorted() {
            let Some(spec) = self.store.spec(&name) else {
                continue;
            };
            let record = match spec.kind {
                ParamType::Int | ParamType::Enum => "longout",
                ParamType::Float => "ao",
                ParamType::Str | ParamType::Bytes => "stringout",
            };
            lines.push_str(&format!("{prefix}{name}, {record}\n"));
        }
        let info_dir = match self.dir.parent() {
            Some(parent) => parent.join("iocInfo"),
            None => PathBuf::from("iocInfo"),
        };
        fs::create_dir_all(&info_dir)?;
        let path = info_dir.join("IOC.pvlist");
        fs::write(&path, lines)?;
        Ok(path)
    }
}

/// Map one stored JSON value onto a parameter's declared type. Integers are
/// compatible with enumeration parameters; everything else must match
/// exactly, and mismatches leave the declared value untouched.
fn decode_entry(spec: &ParamSpec, raw: &serde_json::Value) -> AppResult<ParamValue> {
    use serde_json::Value;

    let value = match raw {
        Value::Number(n) if n.is_i64() => ParamValue::Int(n.as_i64().unwrap_or_default()),
        Value::Number(n) => ParamValue::Float(n.as_f64().unwrap_or_default()),
        Value::String(s) => ParamValue::Str(s.clone()),
        Value::Array(items) => {
            let mut bytes = Vec::with_capacity(items.len());
            for item in items {
                let byte = item
                    .as_u64()
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(|| {
                        CamError::Snapshot(format!("array entry {item} is not a byte"))
                    })?;
                bytes.push(byte);
            }
            ParamValue::Bytes(bytes)
        }
        other => {
            return Err(CamError::Snapshot(format!(
                "unsupported snapshot value: {other}"
            )))
        }
    };
    if spec.accepts(&value) {
        Ok(value)
    } else {
        Err(CamError::TypeMismatch {
            name: spec.name.clone(),
            expected: spec.kind,
            actual: value.kind(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> Arc<ParameterStore> {
        Arc::new(ParameterStore::from_catalog(vec![
            ParamSpec::new("GAIN", ParamValue::Float(0.0)).durable(),
            ParamSpec::new("OFFSET", ParamValue::Int(100)).durable(),
            ParamSpec::new("LABEL", ParamValue::Str("default".into())).durable(),
            ParamSpec::new("MODE", ParamValue::Enum(0)).durable(),
            ParamSpec::new("FIDUCIAL", ParamValue::Int(0)).read_only(),
        ]))
    }

    fn snapshot_store(store: Arc<ParameterStore>, dir: &TempDir, retention: usize) -> SnapshotStore {
        SnapshotStore::new(store, dir.path().join("autosave"), retention).unwrap()
    }

    #[test]
    fn non_directory_path_is_fatal() {
        let dir = TempDir::new().unwrap();
        let clash = dir.path().join("autosave");
        fs::write(&clash, b"not a directory").unwrap();
        let err = SnapshotStore::new(test_store(), clash, 8).err().unwrap();
        assert!(matches!(err, CamError::Snapshot(_)));
    }

    #[test]
    fn durable_keys_come_from_the_catalog() {
        let dir = TempDir::new().unwrap();
        let snapshots = snapshot_store(test_store(), &dir, 8);
        assert_eq!(snapshots.durable_keys(), ["GAIN", "LABEL", "MODE", "OFFSET"]);
    }

    #[tokio::test]
    async fn save_then_restore_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = test_store();
        store.set("GAIN", ParamValue::Float(2.5)).await.unwrap();
        store.set("OFFSET", ParamValue::Int(-3)).await.unwrap();
        store.set("LABEL", ParamValue::Str("hutch".into())).await.unwrap();
        store.set("MODE", ParamValue::Int(4)).await.unwrap();
        let snapshots = snapshot_store(store, &dir, 8);
        snapshots.save().await.unwrap();

        // Fresh store with catalog defaults, same directory
        let fresh = test_store();
        let restored = SnapshotStore::new(fresh.clone(), dir.path().join("autosave"), 8).unwrap();
        assert!(restored.restore().await);
        assert_eq!(fresh.get("GAIN").await, Some(ParamValue::Float(2.5)));
        assert_eq!(fresh.get("OFFSET").await, Some(ParamValue::Int(-3)));
        assert_eq!(fresh.get("LABEL").await, Some(ParamValue::Str("hutch".into())));
        assert_eq!(fresh.get("MODE").await, Some(ParamValue::Enum(4)));
    }

    #[tokio::test]
    async fn empty_durable_set_restores_nothing() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ParameterStore::from_catalog(vec![ParamSpec::new(
            "FIDUCIAL",
            ParamValue::Int(7),
        )
        .read_only()]));
        let snapshots = snapshot_store(store.clone(), &dir, 8);
        snapshots.save().await.unwrap();
        assert!(!snapshots.restore().await);
        assert_eq!(store.get("FIDUCIAL").await, Some(ParamValue::Int(7)));
    }

    #[tokio::test]
    async fn retention_keeps_only_newest_files() {
        let dir = TempDir::new().unwrap();
        let snapshots = snapshot_store(test_store(), &dir, 3);
        let mut written = Vec::new();
        for _ in 0..7 {
            written.push(snapshots.save().await.unwrap());
        }
        let remaining = snapshots.list_snapshots().unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining, written[written.len() - 3..]);
    }

    #[tokio::test]
    async fn restore_falls_back_past_corrupted_files() {
        let dir = TempDir::new().unwrap();
        let store = test_store();
        let snapshots = snapshot_store(store.clone(), &dir, 8);
        let autosave = snapshots.directory().to_path_buf();

        // Oldest file is the only fully valid one
        fs::write(
            autosave.join("20200101-000000.000000.json"),
            r#"{"GAIN": 7.5, "OFFSET": 42}"#,
        )
        .unwrap();
        // Newer: unparsable
        fs::write(autosave.join("20300101-000000.000000.json"), b"{ nope").unwrap();
        // Newest: every entry has the wrong type
        fs::write(
            autosave.join("20300102-000000.000000.json"),
            r#"{"GAIN": "loud", "OFFSET": 1.5}"#,
        )
        .unwrap();

        assert!(snapshots.restore().await);
        assert_eq!(store.get("GAIN").await, Some(ParamValue::Float(7.5)));
        assert_eq!(store.get("OFFSET").await, Some(ParamValue::Int(42)));
    }

    #[tokio::test]
    async fn partially_valid_newest_file_wins_over_older_valid_one() {
        let dir = TempDir::new().unwrap();
        let store = test_store();
        let snapshots = snapshot_store(store.clone(), &dir, 8);
        let autosave = snapshots.directory().to_path_buf();

        fs::write(
            autosave.join("20200101-000000.000000.json"),
            r#"{"GAIN": 1.0, "OFFSET": 1}"#,
        )
        .unwrap();
        // Newest has one good entry and one bad one: accepted, no fallback
        fs::write(
            autosave.join("20300101-000000.000000.json"),
            r#"{"GAIN": 9.0, "OFFSET": "bad"}"#,
        )
        .unwrap();

        assert!(snapshots.restore().await);
        assert_eq!(store.get("GAIN").await, Some(ParamValue::Float(9.0)));
        // Bad entry skipped; older file's OFFSET never loaded
        assert_eq!(store.get("OFFSET").await, Some(ParamValue::Int(100)));
    }

    #[tokio::test]
    async fn restore_with_no_files_reports_failure() {
        let dir = TempDir::new().unwrap();
        let snapshots = snapshot_store(test_store(), &dir, 8);
        assert!(!snapshots.restore().await);
    }

    #[tokio::test]
    async fn float_parameter_rejects_integer_snapshot_value() {
        let dir = TempDir::new().unwrap();
        let store = test_store();
        let snapshots = snapshot_store(store.clone(), &dir, 8);
        fs::write(
            snapshots.directory().join("20250101-000000.000000.json"),
            r#"{"GAIN": 3, "OFFSET": 11}"#,
        )
        .unwrap();
        assert!(snapshots.restore().await);
        // GAIN skipped on type grounds, OFFSET applied
        assert_eq!(store.get("GAIN").await, Some(ParamValue::Float(0.0)));
        assert_eq!(store.get("OFFSET").await, Some(ParamValue::Int(11)));
    }

    #[tokio::test]
    async fn periodic_task_saves_and_exits_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let snapshots = Arc::new(snapshot_store(test_store(), &dir, 8));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(
            snapshots
                .clone()
                .run(Duration::from_millis(20), shutdown_rx),
        );
        tokio::time::sleep(Duration::from_millis(90)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        // At least a couple of periodic saves plus the final one
        assert!(snapshots.list_snapshots().unwrap().len() >= 3);
    }

    #[test]
    fn param_list_is_written_outside_the_snapshot_directory() {
        let dir = TempDir::new().unwrap();
        let snapshots = snapshot_store(test_store(), &dir, 8);
        let path = snapshots.write_param_list("TST:CAM:").unwrap();
        assert_eq!(path, dir.path().join("iocInfo").join("IOC.pvlist"));
        // The listing must never compete with snapshot retention
        assert!(snapshots.list_snapshots().unwrap().is_empty());
        let body = fs::read_to_string(path).unwrap();
        assert!(body.contains("TST:CAM:GAIN, ao"));
        assert!(body.contains("TST:CAM:OFFSET, longout"));
        assert!(body.contains("TST:CAM:LABEL, stringout"));
    }
}
