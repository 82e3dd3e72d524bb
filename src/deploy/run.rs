use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Directories,
    FetchSource,
    InstallDependencies,
    ServiceUnit,
    Secrets,
    Database,
    Assets,
    ProxyRoute,
    Certificate,
    StartService,
    Verify,
}

impl Step {
    pub const ALL: [Step; 11] = [
        Step::Directories,
        Step::FetchSource,
        Step::InstallDependencies,
        Step::ServiceUnit,
        Step::Secrets,
        Step::Database,
        Step::Assets,
        Step::ProxyRoute,
        Step::Certificate,
        Step::StartService,
        Step::Verify,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Step::Directories => "directories",
            Step::FetchSource => "fetch_source",
            Step::InstallDependencies => "install_dependencies",
            Step::ServiceUnit => "service_unit",
            Step::Secrets => "secrets",
            Step::Database => "database",
            Step::Assets => "assets",
            Step::ProxyRoute => "proxy_route",
            Step::Certificate => "certificate",
            Step::StartService => "start_service",
            Step::Verify => "verify",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Step::Directories => "Creating directories",
            Step::FetchSource => "Fetching source",
            Step::InstallDependencies => "Installing dependencies",
            Step::ServiceUnit => "Preparing service unit",
            Step::Secrets => "Injecting secrets",
            Step::Database => "Preparing database",
            Step::Assets => "Building assets",
            Step::ProxyRoute => "Configuring proxy route",
            Step::Certificate => "Issuing certificate",
            Step::StartService => "Starting service",
            Step::Verify => "Verifying",
        }
    }

    /// 1-based position in the fixed sequence.
    pub fn number(&self) -> usize {
        *self as usize + 1
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: Step,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Pending,
    Succeeded,
    Failed,
    VerificationFailed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureDetail {
    pub step: Step,
    pub message: String,
}

/// One deployment attempt. Records are append-only and in step order.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRun {
    pub app: String,
    pub branch: String,
    pub setup: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub records: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    #[serde(skip)]
    current: Option<(Step, DateTime<Utc>)>,
}

impl DeploymentRun {
    pub fn new(app: &str, branch: &str, setup: bool) -> Self {
        Self {
            app: app.to_string(),
            branch: branch.to_string(),
            setup,
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::Pending,
            records: Vec::new(),
            failure: None,
            current: None,
        }
    }

    pub fn begin(&mut self, step: Step) {
        debug_assert!(
            self.records.last().map_or(true, |r| r.step < step),
            "steps must be recorded in order"
        );
        self.current = Some((step, Utc::now()));
    }

    fn record(&mut self, status: StepStatus, detail: Option<String>) -> Option<Step> {
        let (step, started_at) = self.current.take()?;
        self.records.push(StepRecord {
            step,
            status,
            started_at,
            finished_at: Utc::now(),
            detail,
        });
        Some(step)
    }

    pub fn succeed(&mut self, detail: Option<String>) {
        self.record(StepStatus::Succeeded, detail);
    }

    pub fn skip(&mut self, detail: impl Into<String>) {
        self.record(StepStatus::Skipped, Some(detail.into()));
    }

    /// Close the current step as failed and end the run.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        if let Some(step) = self.record(StepStatus::Failed, Some(message.clone())) {
            self.outcome = if step == Step::Verify {
                RunOutcome::VerificationFailed
            } else {
                RunOutcome::Failed
            };
            self.failure = Some(FailureDetail { step, message });
        }
        self.finished_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.current = None;
        self.outcome = RunOutcome::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    pub fn finish(&mut self) {
        self.outcome = RunOutcome::Succeeded;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    pub fn status_of(&self, step: Step) -> Option<StepStatus> {
        self.records.iter().find(|r| r.step == step).map(|r| r.status)
    }
}

/// Set from outside a run (Ctrl-C); read at step boundaries only.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_numbered_in_order() {
        assert_eq!(Step::Directories.number(), 1);
        assert_eq!(Step::Verify.number(), 11);
        assert!(Step::ALL.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn failing_verify_is_a_verification_failure() {
        let mut run = DeploymentRun::new("sample", "main", false);
        run.begin(Step::StartService);
        run.succeed(None);
        run.begin(Step::Verify);
        run.fail("503");

        assert_eq!(run.outcome, RunOutcome::VerificationFailed);
        assert_eq!(run.failure.as_ref().unwrap().step, Step::Verify);
        assert_eq!(run.status_of(Step::StartService), Some(StepStatus::Succeeded));
    }

    #[test]
    fn serializes_with_snake_case_names() {
        let mut run = DeploymentRun::new("sample", "main", true);
        run.begin(Step::FetchSource);
        run.fail("clone failed");

        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["records"][0]["step"], "fetch_source");
        assert_eq!(json["failure"]["message"], "clone failed");
    }
}
