//! Wire and domain types for composition requests and job records.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Canvas width/height bounds accepted at admission.
pub const MIN_DIMENSION: u32 = 16;
pub const MAX_DIMENSION: u32 = 7680;
/// Element count bounds accepted at admission.
pub const MAX_ELEMENTS: usize = 10;

/// Reference canvas used to scale duration estimates (1920x1080).
pub const REFERENCE_PIXELS: u64 = 1920 * 1080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Mov,
    Avi,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Mp4 => write!(f, "mp4"),
            OutputFormat::Mov => write!(f, "mov"),
            OutputFormat::Avi => write!(f, "avi"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Video,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    #[default]
    Auto,
    Contain,
    Cover,
    Fill,
}

/// A percentage carried as its original string (`"12.5%"`), validated at
/// parse time against `^\d+(\.\d+)?%$`.
#[derive(Debug, Clone, PartialEq)]
pub struct Percent {
    raw: String,
    value: f64,
}

impl Percent {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let Some(digits) = raw.strip_suffix('%') else {
            return Err(format!("'{raw}' is not a percentage (missing '%')"));
        };
        let mut seen_dot = false;
        let mut seen_digit_before_dot = false;
        let mut seen_digit_after_dot = false;
        for c in digits.chars() {
            match c {
                '0'..='9' if !seen_dot => seen_digit_before_dot = true,
                '0'..='9' => seen_digit_after_dot = true,
                '.' if !seen_dot && seen_digit_before_dot => seen_dot = true,
                _ => return Err(format!("'{raw}' is not a percentage")),
            }
        }
        if !seen_digit_before_dot || (seen_dot && !seen_digit_after_dot) {
            return Err(format!("'{raw}' is not a percentage"));
        }
        let value: f64 = digits
            .parse()
            .map_err(|_| format!("'{raw}' is not a percentage"))?;
        Ok(Percent { raw: raw.to_string(), value })
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn zero() -> Self {
        Percent { raw: "0%".into(), value: 0.0 }
    }

    pub fn full() -> Self {
        Percent { raw: "100%".into(), value: 100.0 }
    }
}

impl FromStr for Percent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Percent::parse(s)
    }
}

impl Serialize for Percent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Percent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Percent::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// One positioned media element on a numbered track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoElement {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    pub source: String,
    pub track: i32,
    #[serde(default = "Percent::zero")]
    pub x: Percent,
    #[serde(default = "Percent::zero")]
    pub y: Percent,
    #[serde(default = "Percent::full")]
    pub width: Percent,
    #[serde(default = "Percent::full")]
    pub height: Percent,
    #[serde(default)]
    pub fit_mode: FitMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl VideoElement {
    /// True when the element deviates from the full-canvas defaults.
    pub fn is_transformed(&self) -> bool {
        self.x.value() != 0.0
            || self.y.value() != 0.0
            || self.width.value() != 100.0
            || self.height.value() != 100.0
            || self.fit_mode != FitMode::Auto
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Declarative composition request as accepted by `POST /video/create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoJobRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub output_format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub elements: Vec<VideoElement>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl VideoJobRequest {
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn has_video(&self) -> bool {
        self.elements.iter().any(|e| e.kind == ElementKind::Video)
    }

    pub fn track_count(&self) -> usize {
        self.elements.iter().map(|e| e.track).collect::<HashSet<_>>().len()
    }

    pub fn has_transform(&self) -> bool {
        self.elements.iter().any(VideoElement::is_transformed)
    }

    /// Admission validation. Collects every violated rule rather than
    /// stopping at the first.
    pub fn validate(&self) -> Result<(), Error> {
        let mut violations = Vec::new();

        if self.width < MIN_DIMENSION || self.width > MAX_DIMENSION {
            violations.push(format!(
                "width {} outside [{MIN_DIMENSION}, {MAX_DIMENSION}]",
                self.width
            ));
        }
        if self.height < MIN_DIMENSION || self.height > MAX_DIMENSION {
            violations.push(format!(
                "height {} outside [{MIN_DIMENSION}, {MAX_DIMENSION}]",
                self.height
            ));
        }
        if self.elements.is_empty() {
            violations.push("at least one element is required".to_string());
        }
        if self.elements.len() > MAX_ELEMENTS {
            violations.push(format!(
                "{} elements exceeds the maximum of {MAX_ELEMENTS}",
                self.elements.len()
            ));
        }

        let mut seen = HashSet::new();
        for element in &self.elements {
            if element.id.is_empty() {
                violations.push("element id must not be empty".to_string());
            } else if !seen.insert(element.id.as_str()) {
                violations.push(format!("duplicate element id '{}'", element.id));
            }
            if element.source.is_empty() {
                violations.push(format!("element '{}' has an empty source", element.id));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation { violations })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    Enterprise,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Moderate => write!(f, "moderate"),
            Complexity::Complex => write!(f, "complex"),
            Complexity::Enterprise => write!(f, "enterprise"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    QuickSync,
    BalancedAsync,
    ResourceIntensive,
    Distributed,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::QuickSync => "quick_sync",
            Strategy::BalancedAsync => "balanced_async",
            Strategy::ResourceIntensive => "resource_intensive",
            Strategy::Distributed => "distributed",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job needs from the node inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub bandwidth_mbps: f64,
    pub gpu: bool,
    #[serde(with = "crate::model::duration_secs")]
    pub estimated_time: Duration,
}

/// Immutable classification derived from a request at admission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobAnalysis {
    #[serde(with = "crate::model::duration_secs")]
    pub estimated_duration: Duration,
    pub resource_requirements: ResourceRequirements,
    pub priority: Priority,
    pub complexity: Complexity,
    pub strategy: Strategy,
    pub risks: Vec<String>,
    pub optimizations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finished artifact descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub size_bytes: u64,
}

/// The queue's view of one job. Snapshots are immutable copies handed to
/// subscribers; mutation happens only through [`crate::job_store::JobStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub request: VideoJobRequest,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub progress_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobSnapshot {
    pub fn new(id: String, request: VideoJobRequest) -> Self {
        let now = Utc::now();
        JobSnapshot {
            id,
            status: JobStatus::Pending,
            request,
            created_at: now,
            updated_at: now,
            progress_percent: 0,
            current_step: None,
            result_url: None,
            file_size_bytes: None,
            processing_time_ms: None,
            error: None,
        }
    }
}

/// Partial update applied atomically by the store.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress_percent: Option<u8>,
    pub current_step: Option<String>,
    pub result_url: Option<String>,
    pub file_size_bytes: Option<u64>,
    pub processing_time_ms: Option<u64>,
    pub error: Option<String>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        JobPatch { status: Some(status), ..Default::default() }
    }

    pub fn progress(percent: u8, step: impl Into<String>) -> Self {
        JobPatch {
            progress_percent: Some(percent.min(100)),
            current_step: Some(step.into()),
            ..Default::default()
        }
    }

    pub fn completed(result: &JobResult, processing_time_ms: u64) -> Self {
        JobPatch {
            status: Some(JobStatus::Completed),
            progress_percent: Some(100),
            current_step: Some("completed".into()),
            result_url: Some(result.url.clone()),
            file_size_bytes: Some(result.size_bytes),
            processing_time_ms: Some(processing_time_ms),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        JobPatch {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, percent: u8) -> Self {
        self.progress_percent = Some(percent.min(100));
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }
}

/// Serde helper storing `Duration` as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
