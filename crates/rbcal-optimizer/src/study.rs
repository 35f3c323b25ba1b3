//! Persistent Bayesian study storage backed by DuckDB.
//!
//! A study file may hold several studies; each is keyed by name. Trials are
//! written as soon as they start and updated when they finish, so an
//! interrupted run leaves its completed trials behind for a later resume.

use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use rbcal_types::{
    CalError, CalResult, ConfigError, OptimizationHistory, ParameterVector, StorageError,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::trial::{StudyTrial, TrialState};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS studies (
        study_name TEXT PRIMARY KEY,
        parameter_names TEXT NOT NULL,
        direction TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS trials (
        study_name TEXT NOT NULL,
        number BIGINT NOT NULL,
        state TEXT NOT NULL,
        params TEXT NOT NULL,
        value DOUBLE,
        value_error DOUBLE,
        message TEXT,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        PRIMARY KEY (study_name, number)
    );";

fn db_error(e: duckdb::Error) -> CalError {
    StorageError::Database {
        message: e.to_string(),
    }
    .into()
}

fn parse_time(text: &str) -> CalResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            StorageError::Database {
                message: format!("bad timestamp '{text}': {e}"),
            }
            .into()
        })
}

/// Aggregate view of a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySummary {
    pub name: String,
    pub parameter_names: Vec<String>,
    pub n_trials: usize,
    pub n_complete: usize,
    pub n_failed: usize,
    pub best_value: Option<f64>,
    pub best_params: Option<ParameterVector>,
}

/// A named, minimizing study and its trials.
#[derive(Debug)]
pub struct Study {
    connection: Connection,
    name: String,
    parameter_names: Vec<String>,
    trials: Vec<StudyTrial>,
}

impl Study {
    /// Open `path` and create the study, or resume it when it exists and
    /// `load_if_exists` is set.
    pub fn create<P: AsRef<Path>>(
        path: P,
        name: &str,
        parameter_names: &[String],
        load_if_exists: bool,
    ) -> CalResult<Self> {
        let connection = Connection::open(path).map_err(db_error)?;
        Self::with_connection(connection, name, parameter_names, load_if_exists)
    }

    pub fn in_memory(name: &str, parameter_names: &[String]) -> CalResult<Self> {
        let connection = Connection::open_in_memory().map_err(db_error)?;
        Self::with_connection(connection, name, parameter_names, false)
    }

    /// Open an existing study; fails if `name` is not in the file.
    pub fn load<P: AsRef<Path>>(path: P, name: &str) -> CalResult<Self> {
        let connection = Connection::open(path).map_err(db_error)?;
        connection.execute_batch(SCHEMA).map_err(db_error)?;
        let parameter_names = stored_parameter_names(&connection, name)?.ok_or_else(|| {
            StorageError::StudyNotFound {
                name: name.to_string(),
            }
        })?;
        let trials = load_trials(&connection, name)?;
        Ok(Self {
            connection,
            name: name.to_string(),
            parameter_names,
            trials,
        })
    }

    fn with_connection(
        connection: Connection,
        name: &str,
        parameter_names: &[String],
        load_if_exists: bool,
    ) -> CalResult<Self> {
        connection.execute_batch(SCHEMA).map_err(db_error)?;

        let trials = match stored_parameter_names(&connection, name)? {
            Some(_) if !load_if_exists => {
                return Err(StorageError::StudyExists {
                    name: name.to_string(),
                }
                .into())
            }
            Some(stored) => {
                if stored.len() != parameter_names.len() {
                    return Err(ConfigError::DimensionMismatch {
                        expected: stored.len(),
                        actual: parameter_names.len(),
                    }
                    .into());
                }
                let trials = load_trials(&connection, name)?;
                tracing::info!(study = name, trials = trials.len(), "Resuming study");
                trials
            }
            None => {
                connection
                    .execute(
                        "INSERT INTO studies (study_name, parameter_names, direction, created_at)
                         VALUES (?, ?, 'minimize', ?)",
                        params![
                            name,
                            serde_json::to_string(parameter_names)?,
                            Utc::now().to_rfc3339()
                        ],
                    )
                    .map_err(db_error)?;
                tracing::debug!(study = name, "Created study");
                Vec::new()
            }
        };

        Ok(Self {
            connection,
            name: name.to_string(),
            parameter_names: parameter_names.to_vec(),
            trials,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    pub fn dimension(&self) -> usize {
        self.parameter_names.len()
    }

    pub fn trials(&self) -> &[StudyTrial] {
        &self.trials
    }

    pub fn completed_trials(&self) -> impl Iterator<Item = &StudyTrial> {
        self.trials.iter().filter(|t| t.is_complete())
    }

    pub fn n_completed(&self) -> usize {
        self.completed_trials().count()
    }

    /// Lowest-value completed trial; ties go to the earlier trial.
    pub fn best_trial(&self) -> Option<&StudyTrial> {
        self.completed_trials()
            .filter(|t| t.value.is_some_and(|v| !v.is_nan()))
            .fold(None, |best: Option<&StudyTrial>, t| match best {
                Some(b) if b.value <= t.value => Some(b),
                _ => Some(t),
            })
    }

    /// Register a running trial and return its number.
    pub fn begin_trial(&mut self, params: ParameterVector) -> CalResult<usize> {
        params.check_dim(self.dimension())?;
        let trial = StudyTrial::new(self.trials.len(), params);
        self.connection
            .execute(
                "INSERT INTO trials (study_name, number, state, params, started_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    self.name,
                    trial.number as i64,
                    trial.state.as_str(),
                    serde_json::to_string(&trial.params)?,
                    trial.started_at.to_rfc3339()
                ],
            )
            .map_err(db_error)?;
        let number = trial.number;
        self.trials.push(trial);
        Ok(number)
    }

    pub fn complete_trial(
        &mut self,
        number: usize,
        value: f64,
        value_error: Option<f64>,
    ) -> CalResult<()> {
        let trial = self.trial_mut(number)?;
        trial.mark_completed(value, value_error);
        let finished = trial.finished_at.map(|t| t.to_rfc3339());
        self.connection
            .execute(
                "UPDATE trials SET state = ?, value = ?, value_error = ?, finished_at = ?
                 WHERE study_name = ? AND number = ?",
                params![
                    TrialState::Complete.as_str(),
                    value,
                    value_error,
                    finished,
                    self.name,
                    number as i64
                ],
            )
            .map_err(db_error)?;
        Ok(())
    }

    pub fn fail_trial(&mut self, number: usize, message: &str) -> CalResult<()> {
        let trial = self.trial_mut(number)?;
        trial.mark_failed(message.to_string());
        let finished = trial.finished_at.map(|t| t.to_rfc3339());
        self.connection
            .execute(
                "UPDATE trials SET state = ?, message = ?, finished_at = ?
                 WHERE study_name = ? AND number = ?",
                params![
                    TrialState::Fail.as_str(),
                    message,
                    finished,
                    self.name,
                    number as i64
                ],
            )
            .map_err(db_error)?;
        tracing::debug!(study = %self.name, trial = number, message, "Trial failed");
        Ok(())
    }

    fn trial_mut(&mut self, number: usize) -> CalResult<&mut StudyTrial> {
        self.trials.get_mut(number).ok_or_else(|| {
            CalError::Internal(format!("study '{}' has no trial {number}", self.name))
        })
    }

    pub fn summary(&self) -> StudySummary {
        let best = self.best_trial();
        StudySummary {
            name: self.name.clone(),
            parameter_names: self.parameter_names.clone(),
            n_trials: self.trials.len(),
            n_complete: self.n_completed(),
            n_failed: self
                .trials
                .iter()
                .filter(|t| t.state == TrialState::Fail)
                .count(),
            best_value: best.and_then(|t| t.value),
            best_params: best.map(|t| t.params.clone()),
        }
    }

    /// Completed trials as a history, in trial order.
    pub fn completed_history(&self) -> CalResult<OptimizationHistory> {
        let mut history = OptimizationHistory::new(self.dimension());
        for trial in self.completed_trials() {
            if let Some(value) = trial.value {
                history.push(trial.params.clone(), value, trial.value_error)?;
            }
        }
        Ok(history)
    }
}

/// Names of all studies stored in `path`.
pub fn list_study_names<P: AsRef<Path>>(path: P) -> CalResult<Vec<String>> {
    let connection = Connection::open(path).map_err(db_error)?;
    connection.execute_batch(SCHEMA).map_err(db_error)?;
    let mut stmt = connection
        .prepare("SELECT study_name FROM studies ORDER BY study_name")
        .map_err(db_error)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(db_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_error)?;
    Ok(names)
}

fn stored_parameter_names(connection: &Connection, name: &str) -> CalResult<Option<Vec<String>>> {
    let mut stmt = connection
        .prepare("SELECT parameter_names FROM studies WHERE study_name = ?")
        .map_err(db_error)?;
    let rows = stmt
        .query_map([name], |row| row.get::<_, String>(0))
        .map_err(db_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_error)?;
    match rows.first() {
        Some(json) => Ok(Some(serde_json::from_str(json)?)),
        None => Ok(None),
    }
}

type TrialRow = (
    i64,
    String,
    String,
    Option<f64>,
    Option<f64>,
    Option<String>,
    String,
    Option<String>,
);

fn load_trials(connection: &Connection, name: &str) -> CalResult<Vec<StudyTrial>> {
    let mut stmt = connection
        .prepare(
            "SELECT number, state, params, value, value_error, message, started_at, finished_at
             FROM trials WHERE study_name = ? ORDER BY number",
        )
        .map_err(db_error)?;
    let rows: Vec<TrialRow> = stmt
        .query_map([name], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        })
        .map_err(db_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_error)?;

    rows.into_iter()
        .map(
            |(number, state, params, value, value_error, message, started_at, finished_at)|
             -> CalResult<StudyTrial> {
                Ok(StudyTrial {
                    number: number as usize,
                    state: state
                        .parse()
                        .map_err(|message| StorageError::Database { message })?,
                    params: serde_json::from_str(&params)?,
                    value,
                    value_error,
                    message,
                    started_at: parse_time(&started_at)?,
                    finished_at: finished_at.as_deref().map(parse_time).transpose()?,
                })
            },
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names() -> Vec<String> {
        vec!["amplitude".to_string(), "frequency".to_string()]
    }

    #[test]
    fn trials_are_tracked_in_memory() {
        let mut study = Study::in_memory("s", &names()).unwrap();
        let a = study.begin_trial(ParameterVector::new(vec![0.1, 5e9])).unwrap();
        let b = study.begin_trial(ParameterVector::new(vec![0.2, 5e9])).unwrap();
        let c = study.begin_trial(ParameterVector::new(vec![0.3, 5e9])).unwrap();
        study.complete_trial(a, 0.004, Some(1e-4)).unwrap();
        study.complete_trial(b, 0.002, None).unwrap();
        study.fail_trial(c, "fit failed").unwrap();

        let summary = study.summary();
        assert_eq!(summary.n_trials, 3);
        assert_eq!(summary.n_complete, 2);
        assert_eq!(summary.n_failed, 1);
        assert_eq!(summary.best_value, Some(0.002));
        assert_eq!(study.best_trial().unwrap().number, 1);
        assert_eq!(study.completed_history().unwrap().len(), 2);
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let mut study = Study::in_memory("s", &names()).unwrap();
        assert!(study.begin_trial(ParameterVector::new(vec![0.1])).is_err());
    }

    #[test]
    fn study_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("study.duckdb");
        {
            let mut study = Study::create(&path, "run", &names(), false).unwrap();
            let n = study.begin_trial(ParameterVector::new(vec![0.1, 5e9])).unwrap();
            study.complete_trial(n, 0.003, Some(2e-4)).unwrap();
            study.begin_trial(ParameterVector::new(vec![0.2, 5e9])).unwrap();
        }

        let study = Study::load(&path, "run").unwrap();
        assert_eq!(study.trials().len(), 2);
        assert_eq!(study.trials()[0].value_error, Some(2e-4));
        assert_eq!(study.trials()[1].state, TrialState::Running);
        assert_eq!(list_study_names(&path).unwrap(), vec!["run".to_string()]);
    }

    #[test]
    fn duplicate_study_needs_load_if_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("study.duckdb");
        drop(Study::create(&path, "run", &names(), false).unwrap());

        let err = Study::create(&path, "run", &names(), false).unwrap_err();
        assert!(matches!(err, CalError::Storage(StorageError::StudyExists { .. })));

        let resumed = Study::create(&path, "run", &names(), true).unwrap();
        assert_eq!(resumed.name(), "run");
    }

    #[test]
    fn missing_study_is_not_found() {
        let dir = tempdir().unwrap();
        let err = Study::load(dir.path().join("none.duckdb"), "ghost").unwrap_err();
        assert!(matches!(err, CalError::Storage(StorageError::StudyNotFound { .. })));
    }
}
