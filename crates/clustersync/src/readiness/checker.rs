//! Per-kind readiness predicates.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};

use super::report::ResourceStatusReport;

const ROLLING_UPDATE: &str = "RollingUpdate";

/// Evaluates whether the workloads in a status report are healthy.
#[derive(Debug, Clone, Copy)]
pub struct ReadyChecker {
    /// Treat intentionally paused workloads as ready.
    pub paused_as_ready: bool,
    /// Require jobs to complete. When false, jobs are always ready.
    pub check_jobs: bool,
}

impl Default for ReadyChecker {
    fn default() -> Self {
        Self {
            paused_as_ready: true,
            check_jobs: true,
        }
    }
}

impl ReadyChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff at least one recognized workload is present and all of
    /// them are ready. Certificate requests do not count.
    pub fn is_app_ready(&self, report: &ResourceStatusReport) -> bool {
        let s = &report.status;
        let present = !s.service_statuses.is_empty()
            || !s.deployment_statuses.is_empty()
            || !s.daemon_set_statuses.is_empty()
            || !s.job_statuses.is_empty()
            || !s.stateful_set_statuses.is_empty()
            || !s.pod_statuses.is_empty();

        if !present {
            log::info!(
                "No resources found in status report {}",
                report.metadata.name.as_deref().unwrap_or("<unnamed>")
            );
            return false;
        }

        s.service_statuses.iter().all(|svc| self.service_ready(svc))
            && s.deployment_statuses.iter().all(|d| self.deployment_ready(d))
            && s.daemon_set_statuses.iter().all(|d| self.daemon_set_ready(d))
            && s.job_statuses.iter().all(|j| self.job_ready(j))
            && s.stateful_set_statuses.iter().all(|st| self.stateful_set_ready(st))
            && s.pod_statuses.iter().all(|p| self.pod_ready(p))
    }

    pub fn service_ready(&self, _service: &Service) -> bool {
        true
    }

    pub fn deployment_ready(&self, deployment: &Deployment) -> bool {
        let spec = deployment.spec.as_ref();
        if self.paused_as_ready && spec.and_then(|s| s.paused).unwrap_or(false) {
            return true;
        }
        let desired = spec.and_then(|s| s.replicas).unwrap_or(1);
        let Some(status) = deployment.status.as_ref() else {
            return false;
        };
        status.updated_replicas.unwrap_or(0) == desired
            && status.ready_replicas.unwrap_or(0) == desired
    }

    pub fn stateful_set_ready(&self, sts: &StatefulSet) -> bool {
        let spec = sts.spec.as_ref();
        let strategy = spec
            .and_then(|s| s.update_strategy.as_ref())
            .and_then(|u| u.type_.as_deref());
        if self.paused_as_ready && strategy.is_some_and(|t| t != ROLLING_UPDATE) {
            return true;
        }
        let desired = spec.and_then(|s| s.replicas).unwrap_or(1);
        let Some(status) = sts.status.as_ref() else {
            return false;
        };
        status.updated_replicas.unwrap_or(0) == desired
            && status.ready_replicas.unwrap_or(0) == desired
    }

    pub fn daemon_set_ready(&self, ds: &DaemonSet) -> bool {
        let strategy = ds
            .spec
            .as_ref()
            .and_then(|s| s.update_strategy.as_ref())
            .and_then(|u| u.type_.as_deref());
        if self.paused_as_ready && strategy.is_some_and(|t| t != ROLLING_UPDATE) {
            return true;
        }
        let Some(status) = ds.status.as_ref() else {
            return false;
        };
        status.desired_number_scheduled == status.number_ready
    }

    pub fn job_ready(&self, job: &Job) -> bool {
        if !self.check_jobs {
            return true;
        }
        job.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Complete" && c.status == "True")
            })
            .unwrap_or(false)
    }

    pub fn pod_ready(&self, pod: &Pod) -> bool {
        pod.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    }
}
