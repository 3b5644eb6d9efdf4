//! Request classification: complexity, strategy, resource requirements, and
//! the duration estimate that drives sync-vs-async routing.
//!
//! Everything here is a pure function of the request, so admission decisions
//! are reproducible.

use std::time::Duration;

use crate::model::{
    Complexity, JobAnalysis, ResourceRequirements, Strategy, VideoJobRequest, REFERENCE_PIXELS,
};

const QHD_PIXELS: u64 = 2560 * 1440;
const UHD_PIXELS: u64 = 3840 * 2160;

pub fn classify_complexity(request: &VideoJobRequest) -> Complexity {
    let elements = request.elements.len();
    let pixels = request.pixels();

    if elements <= 2 && pixels <= REFERENCE_PIXELS && !request.has_video() {
        Complexity::Simple
    } else if elements <= 5 && pixels <= QHD_PIXELS {
        Complexity::Moderate
    } else if elements <= 10 && pixels <= UHD_PIXELS {
        Complexity::Complex
    } else {
        Complexity::Enterprise
    }
}

pub fn select_strategy(complexity: Complexity) -> Strategy {
    match complexity {
        Complexity::Simple => Strategy::QuickSync,
        Complexity::Moderate => Strategy::BalancedAsync,
        Complexity::Complex => Strategy::ResourceIntensive,
        Complexity::Enterprise => Strategy::Distributed,
    }
}

/// `(5 + 3n) * multiplier * max(1, pixels/1080p)` seconds, where the
/// multiplier adds 0.5 for any video element, 0.3 for multi-track layouts,
/// and 0.2 for transformed elements.
pub fn estimate_duration(request: &VideoJobRequest) -> Duration {
    let base = 5.0 + 3.0 * request.elements.len() as f64;

    let mut multiplier = 1.0;
    if request.has_video() {
        multiplier += 0.5;
    }
    if request.track_count() > 1 {
        multiplier += 0.3;
    }
    if request.has_transform() {
        multiplier += 0.2;
    }

    let pixel_scale = (request.pixels() as f64 / REFERENCE_PIXELS as f64).max(1.0);
    Duration::from_secs((base * multiplier * pixel_scale).round() as u64)
}

pub fn derive_requirements(request: &VideoJobRequest) -> ResourceRequirements {
    let elements = request.elements.len() as f64;
    let pixel_scale = (request.pixels() as f64 / REFERENCE_PIXELS as f64).max(1.0);
    let gpu = request.has_video() && request.pixels() > QHD_PIXELS;

    ResourceRequirements {
        cpu: 1.0 + 0.5 * elements + if request.has_video() { 1.0 } else { 0.0 },
        memory_gb: 1.0 + 0.25 * elements + pixel_scale,
        storage_gb: 2.0 + 0.5 * elements,
        bandwidth_mbps: 50.0 + 25.0 * elements,
        gpu,
        estimated_time: estimate_duration(request),
    }
}

fn derive_risks(request: &VideoJobRequest, estimated: Duration) -> Vec<String> {
    let mut risks = Vec::new();
    if request.pixels() >= UHD_PIXELS {
        risks.push("4K+ canvas multiplies transcode time".to_string());
    }
    if request.has_video() && request.elements.len() > 5 {
        risks.push("many video layers increase codec memory pressure".to_string());
    }
    if estimated > Duration::from_secs(300) {
        risks.push("long-running job; progress stalls will hold a worker slot".to_string());
    }
    risks
}

fn derive_optimizations(request: &VideoJobRequest, requirements: &ResourceRequirements) -> Vec<String> {
    let mut optimizations = Vec::new();
    if !request.has_video() && request.elements.len() == 1 {
        optimizations.push("single still image composites on the fast path".to_string());
    }
    if requirements.gpu {
        optimizations.push("profile qualifies for gpu-accelerated encoding".to_string());
    }
    if request.track_count() <= 1 {
        optimizations.push("single track allows sequential compositing".to_string());
    }
    optimizations
}

/// Derive the full immutable analysis for one request.
pub fn analyze(request: &VideoJobRequest) -> JobAnalysis {
    let complexity = classify_complexity(request);
    let strategy = select_strategy(complexity);
    let estimated_duration = estimate_duration(request);
    let resource_requirements = derive_requirements(request);
    let risks = derive_risks(request, estimated_duration);
    let optimizations = derive_optimizations(request, &resource_requirements);

    JobAnalysis {
        estimated_duration,
        resource_requirements,
        priority: request.priority,
        complexity,
        strategy,
        risks,
        optimizations,
    }
}
