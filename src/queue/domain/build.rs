//! Build aggregate root: one CI failure and its remediation outcome.

use super::{BuildId, BuildNumber, BuildStatus, JobName, Payload, QueueDomainError};
use chrono::{DateTime, Utc};
use mockable::Clock;
use serde::{Deserialize, Serialize};

/// Failure report accepted from the webhook producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSubmission {
    job: String,
    build_number: u64,
    branch: Option<String>,
    repo_url: Option<String>,
    commit_sha: Option<String>,
    payload: Payload,
}

impl BuildSubmission {
    /// Creates a submission with the required identifying fields.
    #[must_use]
    pub fn new(job: impl Into<String>, build_number: u64) -> Self {
        Self {
            job: job.into(),
            build_number,
            branch: None,
            repo_url: None,
            commit_sha: None,
            payload: Payload::new(),
        }
    }

    /// Sets the branch the failure happened on.
    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Sets the repository URL.
    #[must_use]
    pub fn with_repo_url(mut self, repo_url: impl Into<String>) -> Self {
        self.repo_url = Some(repo_url.into());
        self
    }

    /// Sets the failing commit SHA.
    #[must_use]
    pub fn with_commit_sha(mut self, commit_sha: impl Into<String>) -> Self {
        self.commit_sha = Some(commit_sha.into());
        self
    }

    /// Sets the original failure context (logs, metadata).
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

/// Build aggregate root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    id: BuildId,
    job: JobName,
    build_number: BuildNumber,
    branch: Option<String>,
    repo_url: Option<String>,
    commit_sha: Option<String>,
    status: BuildStatus,
    payload: Payload,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Parameter object for reconstructing a persisted build aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedBuildData {
    /// Persisted build identifier.
    pub id: BuildId,
    /// Persisted job name.
    pub job: JobName,
    /// Persisted build number.
    pub build_number: BuildNumber,
    /// Persisted branch, if any.
    pub branch: Option<String>,
    /// Persisted repository URL, if any.
    pub repo_url: Option<String>,
    /// Persisted commit SHA, if any.
    pub commit_sha: Option<String>,
    /// Persisted lifecycle status.
    pub status: BuildStatus,
    /// Persisted failure context.
    pub payload: Payload,
    /// Persisted creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Persisted latest update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Build {
    /// Creates a new build in [`BuildStatus::Processing`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueDomainError`] when the job name or build number is
    /// invalid.
    pub fn new(submission: BuildSubmission, clock: &impl Clock) -> Result<Self, QueueDomainError> {
        let BuildSubmission {
            job,
            build_number,
            branch,
            repo_url,
            commit_sha,
            payload,
        } = submission;
        let timestamp = clock.utc();
        Ok(Self {
            id: BuildId::new(),
            job: JobName::new(job)?,
            build_number: BuildNumber::new(build_number)?,
            branch: non_blank(branch),
            repo_url: non_blank(repo_url),
            commit_sha: non_blank(commit_sha),
            status: BuildStatus::Processing,
            payload,
            created_at: timestamp,
            updated_at: timestamp,
        })
    }

    /// Reconstructs a build from persisted storage.
    #[must_use]
    pub fn from_persisted(data: PersistedBuildData) -> Self {
        Self {
            id: data.id,
            job: data.job,
            build_number: data.build_number,
            branch: data.branch,
            repo_url: data.repo_url,
            commit_sha: data.commit_sha,
            status: data.status,
            payload: data.payload,
            created_at: data.created_at,
            updated_at: data.updated_at,
        }
    }

    /// Returns the build identifier.
    #[must_use]
    pub const fn id(&self) -> BuildId {
        self.id
    }

    /// Returns the CI job name.
    #[must_use]
    pub const fn job(&self) -> &JobName {
        &self.job
    }

    /// Returns the CI build number.
    #[must_use]
    pub const fn build_number(&self) -> BuildNumber {
        self.build_number
    }

    /// Returns the branch, if known.
    #[must_use]
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// Returns the repository URL, if known.
    #[must_use]
    pub fn repo_url(&self) -> Option<&str> {
        self.repo_url.as_deref()
    }

    /// Returns the failing commit SHA, if known.
    #[must_use]
    pub fn commit_sha(&self) -> Option<&str> {
        self.commit_sha.as_deref()
    }

    /// Returns the build status.
    #[must_use]
    pub const fn status(&self) -> BuildStatus {
        self.status
    }

    /// Returns the original failure context.
    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the latest update timestamp.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Moves the build to `status` when its current status is one of
    /// `only_from`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueDomainError::InvalidBuildTransition`] when the current
    /// status is not in `only_from`.
    pub fn transition_to(
        &mut self,
        status: BuildStatus,
        only_from: &[BuildStatus],
        now: DateTime<Utc>,
    ) -> Result<(), QueueDomainError> {
        if !only_from.contains(&self.status) {
            return Err(QueueDomainError::InvalidBuildTransition {
                build_id: self.id,
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.updated_at = now;
        Ok(())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_owned())
        .filter(|trimmed| !trimmed.is_empty())
}
