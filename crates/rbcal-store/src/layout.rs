use chrono::{DateTime, Utc};
use rbcal_types::CalResult;
use std::path::{Path, PathBuf};

pub const OPTIMIZATION_DATA_DIR: &str = "optimization_data";
pub const ANALYSIS_DIR: &str = "opt_analysis";
pub const STUDY_DIR: &str = "optuna_data";
pub const HISTORY_FILE_NAME: &str = "optimization_history.parquet";
pub const RESULT_FILE_NAME: &str = "optimization_result.json";
pub const TIME_LOG_FILE_NAME: &str = "time_log.txt";
pub const STUDY_EXTENSION: &str = "duckdb";
pub const LABEL_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Directory layout of one calibration run under an output root.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLayout {
    pub root: PathBuf,
    pub target: String,
    pub method: String,
    pub label: String,
}

impl RunLayout {
    /// Layout labelled with the run's start time.
    pub fn new<P: AsRef<Path>>(
        root: P,
        target: impl Into<String>,
        method: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            target: target.into(),
            method: method.into(),
            label: started_at.format(LABEL_FORMAT).to_string(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// `<target>_<method>_<label>`
    pub fn run_name(&self) -> String {
        format!("{}_{}_{}", self.target, self.method, self.label)
    }

    /// Measurement session data.
    pub fn session_dir(&self) -> PathBuf {
        self.root.join(OPTIMIZATION_DATA_DIR).join(self.run_name())
    }

    /// History archive and result record.
    pub fn analysis_dir(&self) -> PathBuf {
        self.root.join(ANALYSIS_DIR).join(self.run_name())
    }

    pub fn history_path(&self) -> PathBuf {
        self.analysis_dir().join(HISTORY_FILE_NAME)
    }

    pub fn result_path(&self) -> PathBuf {
        self.analysis_dir().join(RESULT_FILE_NAME)
    }

    pub fn study_dir(&self) -> PathBuf {
        self.root.join(STUDY_DIR)
    }

    /// Bayesian studies are named by label alone and filed per target.
    pub fn study_name(&self) -> &str {
        &self.label
    }

    pub fn study_path(&self) -> PathBuf {
        self.study_dir()
            .join(format!("{}_{}.{}", self.target, self.label, STUDY_EXTENSION))
    }

    pub fn time_log_path(&self) -> PathBuf {
        self.study_dir().join(TIME_LOG_FILE_NAME)
    }

    /// Create the analysis and study directories. The session directory is
    /// created by the session itself.
    pub fn create_dirs(&self) -> CalResult<()> {
        std::fs::create_dir_all(self.analysis_dir())?;
        std::fs::create_dir_all(self.study_dir())?;
        Ok(())
    }
}

/// Run directories found under `<root>/opt_analysis` that contain a history
/// archive, sorted by name.
pub fn list_analysis_runs<P: AsRef<Path>>(root: P) -> CalResult<Vec<PathBuf>> {
    list_matching(&root.as_ref().join(ANALYSIS_DIR), |path| {
        path.is_dir() && path.join(HISTORY_FILE_NAME).exists()
    })
}

/// Study databases found under `<root>/optuna_data`, sorted by name.
pub fn list_studies<P: AsRef<Path>>(root: P) -> CalResult<Vec<PathBuf>> {
    list_matching(&root.as_ref().join(STUDY_DIR), |path| {
        path.extension().and_then(|s| s.to_str()) == Some(STUDY_EXTENSION)
    })
}

/// Study name encoded in a study file name: everything after the first
/// underscore, without the extension.
pub fn study_name_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    stem.split_once('_').map(|(_, name)| name.to_string())
}

fn list_matching(dir: &Path, keep: impl Fn(&Path) -> bool) -> CalResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if keep(&path) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn layout(root: &Path) -> RunLayout {
        let started = Utc.with_ymd_and_hms(2024, 11, 10, 21, 12, 11).unwrap();
        RunLayout::new(root, "D1", "nelder-mead", started)
    }

    #[test]
    fn paths_follow_run_name() {
        let layout = layout(Path::new("/data"));

        assert_eq!(layout.label, "20241110_211211");
        assert_eq!(
            layout.session_dir(),
            PathBuf::from("/data/optimization_data/D1_nelder-mead_20241110_211211")
        );
        assert_eq!(
            layout.history_path(),
            PathBuf::from("/data/opt_analysis/D1_nelder-mead_20241110_211211/optimization_history.parquet")
        );
        assert_eq!(
            layout.study_path(),
            PathBuf::from("/data/optuna_data/D1_20241110_211211.duckdb")
        );
        assert_eq!(
            layout.time_log_path(),
            PathBuf::from("/data/optuna_data/time_log.txt")
        );
    }

    #[test]
    fn study_name_round_trips_through_file_name() {
        let layout = layout(Path::new("/data"));
        assert_eq!(
            study_name_from_path(&layout.study_path()).as_deref(),
            Some(layout.study_name())
        );
    }

    #[test]
    fn listing_skips_incomplete_runs() {
        let dir = tempdir().unwrap();
        let complete = layout(dir.path());
        complete.create_dirs().unwrap();
        std::fs::write(complete.history_path(), b"").unwrap();
        let incomplete = layout(dir.path()).with_label("partial");
        incomplete.create_dirs().unwrap();

        let runs = list_analysis_runs(dir.path()).unwrap();
        assert_eq!(runs, vec![complete.analysis_dir()]);
        assert!(list_studies(dir.path()).unwrap().is_empty());
    }
}
