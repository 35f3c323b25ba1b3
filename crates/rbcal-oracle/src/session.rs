//! Scoped measurement session.
//!
//! An [`OracleSession`] exclusively borrows an oracle for the duration of one
//! calibration run. Opening connects the oracle and takes a lock file in the
//! session directory; closing (or dropping) persists, disconnects and
//! releases the lock on every exit path.

use chrono::{DateTime, Utc};
use rbcal_types::{CalResult, SessionError};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::oracle::MeasurementOracle;

pub const LOCK_FILE_NAME: &str = ".session.lock";
pub const MANIFEST_FILE_NAME: &str = "session.json";

/// Parameters used to open a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub name: String,
    pub platform: String,
    pub targets: Vec<String>,
    pub path: PathBuf,
    /// Persist the live calibration state when the session closes.
    pub update_on_close: bool,
    /// Remove a stale lock left behind by a crashed run.
    pub force: bool,
}

impl SessionConfig {
    pub fn new(name: impl Into<String>, platform: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
            targets: Vec::new(),
            path: path.into(),
            update_on_close: false,
            force: false,
        }
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_update_on_close(mut self, update: bool) -> Self {
        self.update_on_close = update;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Written next to the session data when the session closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub id: Uuid,
    pub name: String,
    pub platform: String,
    pub targets: Vec<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub updated_platform: bool,
}

/// Exclusive, scoped borrow of a measurement oracle.
pub struct OracleSession<'a, O: MeasurementOracle + ?Sized> {
    id: Uuid,
    config: SessionConfig,
    oracle: &'a mut O,
    lock_path: PathBuf,
    opened_at: DateTime<Utc>,
    started: Instant,
    released: bool,
}

impl<'a, O: MeasurementOracle + ?Sized> OracleSession<'a, O> {
    /// Connect `oracle` and lock the session directory.
    pub fn open(oracle: &'a mut O, config: SessionConfig) -> CalResult<Self> {
        let available = oracle.targets();
        if let Some(unknown) = config.targets.iter().find(|t| !available.contains(*t)) {
            return Err(SessionError::UnknownTarget {
                target: unknown.clone(),
            }
            .into());
        }

        fs::create_dir_all(&config.path)?;
        let lock_path = config.path.join(LOCK_FILE_NAME);
        if config.force && lock_path.exists() {
            warn!(path = %lock_path.display(), "Removing stale session lock");
            fs::remove_file(&lock_path)?;
        }
        acquire_lock(&lock_path)?;

        if let Err(e) = oracle.connect() {
            if let Err(cleanup) = fs::remove_file(&lock_path) {
                warn!(path = %lock_path.display(), error = %cleanup, "Failed to remove session lock");
            }
            return Err(e);
        }

        let id = Uuid::new_v4();
        info!(
            session = %id,
            name = %config.name,
            platform = %config.platform,
            path = %config.path.display(),
            "Opened measurement session"
        );

        Ok(Self {
            id,
            config,
            oracle,
            lock_path,
            opened_at: Utc::now(),
            started: Instant::now(),
            released: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn oracle(&self) -> &O {
        &*self.oracle
    }

    pub fn oracle_mut(&mut self) -> &mut O {
        &mut *self.oracle
    }

    /// Seconds since the session was opened.
    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Persist (if configured), write the manifest, disconnect and release
    /// the lock.
    pub fn close(mut self) -> CalResult<SessionManifest> {
        self.released = true;
        self.finish()
    }

    fn finish(&mut self) -> CalResult<SessionManifest> {
        let mut first_error = None;

        if self.config.update_on_close {
            if let Err(e) = self.oracle.persist() {
                warn!(session = %self.id, error = %e, "Failed to persist calibration state");
                first_error.get_or_insert(e);
            }
        }

        let manifest = SessionManifest {
            id: self.id,
            name: self.config.name.clone(),
            platform: self.config.platform.clone(),
            targets: self.config.targets.clone(),
            opened_at: self.opened_at,
            closed_at: Utc::now(),
            elapsed_seconds: self.elapsed(),
            updated_platform: self.config.update_on_close,
        };
        if let Err(e) = write_manifest(&self.config.path, &manifest) {
            first_error.get_or_insert(e);
        }

        if let Err(e) = self.oracle.disconnect() {
            first_error.get_or_insert(e);
        }
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != ErrorKind::NotFound {
                first_error.get_or_insert(e.into());
            }
        }

        info!(
            session = %self.id,
            elapsed = manifest.elapsed_seconds,
            "Closed measurement session"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(manifest),
        }
    }
}

impl<O: MeasurementOracle + ?Sized> Drop for OracleSession<'_, O> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(session = %self.id, "Measurement session dropped without close, releasing");
        if let Err(e) = self.finish() {
            warn!(session = %self.id, error = %e, "Error while releasing session");
        }
        self.released = true;
    }
}

fn acquire_lock(path: &Path) -> CalResult<()> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            writeln!(file, "{}", std::process::id())?;
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(SessionError::Locked {
            path: path.display().to_string(),
        }
        .into()),
        Err(e) => Err(e.into()),
    }
}

fn write_manifest(dir: &Path, manifest: &SessionManifest) -> CalResult<()> {
    let json = serde_json::to_string_pretty(manifest)?;
    fs::write(dir.join(MANIFEST_FILE_NAME), json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{ConnectionStatus, RbConfig};
    use crate::simulated::SimulatedOracle;
    use rbcal_types::CalError;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> SessionConfig {
        SessionConfig::new("rb_test", "dummy", dir.path().join("session"))
            .with_targets(vec!["0".to_string()])
    }

    #[test]
    fn open_connects_and_close_releases() {
        let dir = TempDir::new().unwrap();
        let mut oracle = SimulatedOracle::with_defaults();

        let session = OracleSession::open(&mut oracle, config(&dir)).unwrap();
        let lock = session.path().join(LOCK_FILE_NAME);
        assert!(lock.exists());
        assert_eq!(session.oracle().connection_status(), ConnectionStatus::Connected);

        let manifest = session.close().unwrap();
        assert!(!lock.exists());
        assert!(!manifest.updated_platform);
        assert!(dir.path().join("session").join(MANIFEST_FILE_NAME).exists());
        assert_eq!(oracle.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(oracle.counters().persists, 0);
    }

    #[test]
    fn second_session_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let mut first = SimulatedOracle::with_defaults();
        let mut second = SimulatedOracle::with_defaults();

        let _held = OracleSession::open(&mut first, config(&dir)).unwrap();
        let err = OracleSession::open(&mut second, config(&dir)).err().unwrap();
        assert!(matches!(err, CalError::Session(SessionError::Locked { .. })));
        assert_eq!(second.connection_status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn force_clears_stale_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(LOCK_FILE_NAME), "12345").unwrap();

        let mut oracle = SimulatedOracle::with_defaults();
        assert!(OracleSession::open(&mut oracle, config(&dir)).is_err());
        let session = OracleSession::open(&mut oracle, config(&dir).with_force(true)).unwrap();
        session.close().unwrap();
    }

    #[test]
    fn drop_after_failure_releases_session() {
        let dir = TempDir::new().unwrap();
        let mut oracle = SimulatedOracle::with_defaults();
        oracle.fail_next(1);

        let result: CalResult<f64> = (|| {
            let mut session =
                OracleSession::open(&mut oracle, config(&dir).with_update_on_close(true))?;
            let output = session
                .oracle_mut()
                .randomized_benchmarking(&RbConfig::default())?;
            Ok(output.decay("0")?.p)
        })();

        assert!(result.unwrap_err().is_measurement_failure());
        assert!(!dir.path().join("session").join(LOCK_FILE_NAME).exists());
        assert_eq!(oracle.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(oracle.counters().persists, 1);
    }

    #[test]
    fn failed_connect_releases_lock() {
        let dir = TempDir::new().unwrap();
        let mut oracle = SimulatedOracle::with_defaults();
        oracle.set_offline(true);

        let err = OracleSession::open(&mut oracle, config(&dir)).err().unwrap();
        assert!(matches!(err, CalError::Session(SessionError::Backend { .. })));
        assert!(!dir.path().join("session").join(LOCK_FILE_NAME).exists());

        oracle.set_offline(false);
        let session = OracleSession::open(&mut oracle, config(&dir)).unwrap();
        session.close().unwrap();
    }

    #[test]
    fn unknown_target_is_rejected_before_connect() {
        let dir = TempDir::new().unwrap();
        let mut oracle = SimulatedOracle::with_defaults();
        let config = config(&dir).with_targets(vec!["q7".to_string()]);

        let err = OracleSession::open(&mut oracle, config).err().unwrap();
        assert!(matches!(err, CalError::Session(SessionError::UnknownTarget { .. })));
        assert_eq!(oracle.connection_status(), ConnectionStatus::Disconnected);
    }
}
