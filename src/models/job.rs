use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::constants::progress;

/// Status of an image processing job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Uploading,
    Completed,
    Failed,
}

/// Pipeline stage a job is currently in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProcessingStep {
    Download,
    Transform,
    Upload,
    Complete,
}

/// A tracked image processing job, as stored and as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub image_url: String,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<ProcessingStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn pending(job_id: impl Into<String>, image_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            image_url: image_url.into(),
            status: JobStatus::Pending,
            progress: progress::PENDING,
            step: None,
            error: None,
            result_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update in place, bumping `updated_at`.
    pub fn apply(&mut self, update: &JobUpdate, now: DateTime<Utc>) {
        self.status = update.status;
        self.progress = update.progress;
        update.step.apply_to(&mut self.step);
        update.error.apply_to(&mut self.error);
        update.result_url.apply_to(&mut self.result_url);
        self.updated_at = now;
    }
}

/// Tri-state field change: leave the stored value alone, overwrite it, or remove it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldUpdate<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T: Clone> FieldUpdate<T> {
    pub fn apply_to(&self, field: &mut Option<T>) {
        match self {
            FieldUpdate::Keep => {}
            FieldUpdate::Set(value) => *field = Some(value.clone()),
            FieldUpdate::Clear => *field = None,
        }
    }

    /// Whether the stored value is touched at all.
    pub fn is_touched(&self) -> bool {
        !matches!(self, FieldUpdate::Keep)
    }

    /// The value written when touched (`None` for `Clear`).
    pub fn value(&self) -> Option<&T> {
        match self {
            FieldUpdate::Set(value) => Some(value),
            _ => None,
        }
    }
}

/// Partial update of a job record. Status and progress are always written.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub progress: u8,
    pub step: FieldUpdate<ProcessingStep>,
    pub error: FieldUpdate<String>,
    pub result_url: FieldUpdate<String>,
}

impl JobUpdate {
    /// Entering a pipeline stage. Clears leftovers from a previous failed attempt.
    pub fn stage(status: JobStatus, progress: u8, step: ProcessingStep) -> Self {
        Self {
            status,
            progress,
            step: FieldUpdate::Set(step),
            error: FieldUpdate::Clear,
            result_url: FieldUpdate::Clear,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            progress: progress::PENDING,
            step: FieldUpdate::Clear,
            error: FieldUpdate::Set(message.into()),
            result_url: FieldUpdate::Clear,
        }
    }

    pub fn completed(result_url: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Completed,
            progress: progress::COMPLETE,
            step: FieldUpdate::Set(ProcessingStep::Complete),
            error: FieldUpdate::Clear,
            result_url: FieldUpdate::Set(result_url.into()),
        }
    }
}
