//! Runs a driver in scaled coordinates while the outside world sees
//! physical ones.

use rbcal_types::{CalResult, ParameterVector, ScaleFactors, TerminationReason};

use crate::driver::{Driver, IterationReport};
use crate::objective::Evaluation;

/// Wraps a driver that works on `physical / factors`. Proposals and reports
/// leave in physical units; observed candidates are scaled on the way in.
#[derive(Debug, Clone)]
pub struct Scaled<D> {
    inner: D,
    factors: ScaleFactors,
}

impl<D: Driver> Scaled<D> {
    pub fn new(inner: D, factors: ScaleFactors) -> Self {
        Self { inner, factors }
    }

    pub fn factors(&self) -> &ScaleFactors {
        &self.factors
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn unscale_report(&self, report: IterationReport) -> CalResult<IterationReport> {
        Ok(IterationReport {
            parameters: self.factors.unscale(&report.parameters)?,
            ..report
        })
    }
}

impl<D: Driver> Driver for Scaled<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn propose(&mut self) -> CalResult<Vec<ParameterVector>> {
        self.inner
            .propose()?
            .iter()
            .map(|x| self.factors.unscale(x))
            .collect()
    }

    fn observe(
        &mut self,
        candidates: &[ParameterVector],
        evaluations: &[Evaluation],
    ) -> CalResult<Option<IterationReport>> {
        let scaled = candidates
            .iter()
            .map(|x| self.factors.scale(x))
            .collect::<CalResult<Vec<_>>>()?;
        self.inner
            .observe(&scaled, evaluations)?
            .map(|report| self.unscale_report(report))
            .transpose()
    }

    fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    fn best_so_far(&self) -> Option<IterationReport> {
        self.inner
            .best_so_far()
            .and_then(|report| self.unscale_report(report).ok())
    }

    fn termination_reason(&self) -> Option<TerminationReason> {
        self.inner.termination_reason()
    }

    fn abandon(&mut self, reason: &str) {
        self.inner.abandon(reason)
    }
}
