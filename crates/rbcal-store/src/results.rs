use rbcal_types::{CalResult, RunRecord};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Persistence of run records and the shared time log.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultStore;

impl ResultStore {
    pub fn write_record<P: AsRef<Path>>(path: P, record: &RunRecord) -> CalResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(path, json)?;
        info!("Saved optimization result to {}", path.display());
        Ok(())
    }

    pub fn read_record<P: AsRef<Path>>(path: P) -> CalResult<RunRecord> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Append a `name\tseconds` line to the time log.
    pub fn append_time_log<P: AsRef<Path>>(path: P, name: &str, seconds: f64) -> CalResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{name}\t{seconds}")?;
        Ok(())
    }

    /// Parse the time log back into `(name, seconds)` entries. Malformed
    /// lines are skipped.
    pub fn read_time_log<P: AsRef<Path>>(path: P) -> CalResult<Vec<(String, f64)>> {
        let contents = std::fs::read_to_string(path)?;
        Ok(contents
            .lines()
            .filter_map(|line| {
                let (name, seconds) = line.split_once('\t')?;
                Some((name.to_string(), seconds.trim().parse().ok()?))
            })
            .collect())
    }
}
