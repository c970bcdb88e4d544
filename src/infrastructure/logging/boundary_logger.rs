use std::time::Instant;
use tracing::{error, info, warn};

/// BoundaryLogger - logs every crossing of a module boundary
///
/// Format: [trace_id] [caller→callee] operation [STAGE] details
///
/// Stages:
/// - ENTRY / ←DONE / ←FAIL for API handlers and services
/// - EXT→ / ←DONE / ←FAIL for external systems (git, docker, stack runtime)
/// - PHASE→ / ←DONE / ←FAIL for pipeline phases
/// - EVT↗ for event bus emission
#[derive(Clone)]
pub struct BoundaryLogger;

impl BoundaryLogger {
    pub fn new() -> Self {
        Self
    }

    /// e.g. [API→Handler] POST /webhooks/github/3 [ENTRY] provider=github
    pub fn api_entry(&self, trace_id: &str, method: &str, path: &str, params: &str) {
        info!(
            trace_id = %trace_id,
            method = %method,
            path = %path,
            flow = "API→Handler",
            stage = "ENTRY",
            "[{}] [API→Handler] {} {} [ENTRY] {}",
            trace_id, method, path, params
        );
    }

    /// e.g. [API→Handler] POST /webhooks/github/3 [←DONE] 12.40ms status=200
    pub fn api_exit(&self, trace_id: &str, method: &str, path: &str, duration_ms: f64, status: u16) {
        info!(
            trace_id = %trace_id,
            method = %method,
            path = %path,
            flow = "API→Handler",
            stage = "←DONE",
            duration_ms = %duration_ms,
            status = %status,
            "[{}] [API→Handler] {} {} [←DONE] {:.2}ms status={}",
            trace_id, method, path, duration_ms, status
        );
    }

    pub fn service_entry<T: std::fmt::Debug>(&self, trace_id: &str, from: &str, service: &str, method: &str, params: &T) {
        info!(
            trace_id = %trace_id,
            flow = format!("{}→{}", from, service),
            stage = "ENTRY",
            "[{}] [{}→{}] {} [ENTRY] params={:?}",
            trace_id, from, service, method, params
        );
    }

    pub fn service_exit(&self, trace_id: &str, from: &str, service: &str, method: &str, duration_ms: f64) {
        info!(
            trace_id = %trace_id,
            flow = format!("{}→{}", from, service),
            stage = "←DONE",
            duration_ms = %duration_ms,
            "[{}] [{}→{}] {} [←DONE] {:.2}ms",
            trace_id, from, service, method, duration_ms
        );
    }

    pub fn service_error<E: std::fmt::Display>(&self, trace_id: &str, from: &str, service: &str, method: &str, error: &E) {
        error!(
            trace_id = %trace_id,
            flow = format!("{}→{}", from, service),
            stage = "←FAIL",
            error = %error,
            "[{}] [{}→{}] {} [←FAIL] error={}",
            trace_id, from, service, method, error
        );
    }

    /// e.g. [Executor→StackRuntime] apply [EXT→]
    pub fn external_call(&self, trace_id: &str, from: &str, system: &str, operation: &str) {
        info!(
            trace_id = %trace_id,
            flow = format!("{}→{}", from, system),
            stage = "EXT→",
            "[{}] [{}→{}] {} [EXT→]",
            trace_id, from, system, operation
        );
    }

    pub fn external_done(&self, trace_id: &str, from: &str, system: &str, operation: &str, duration_ms: f64) {
        info!(
            trace_id = %trace_id,
            flow = format!("{}→{}", from, system),
            stage = "←DONE",
            duration_ms = %duration_ms,
            "[{}] [{}→{}] {} [←DONE] {:.2}ms",
            trace_id, from, system, operation, duration_ms
        );
    }

    pub fn external_error<E: std::fmt::Display>(&self, trace_id: &str, from: &str, system: &str, operation: &str, error: &E) {
        error!(
            trace_id = %trace_id,
            flow = format!("{}→{}", from, system),
            stage = "←FAIL",
            error = %error,
            "[{}] [{}→{}] {} [←FAIL] error={}",
            trace_id, from, system, operation, error
        );
    }

    /// e.g. [Worker→Pipeline] build [PHASE→] deployment=12
    pub fn phase_entry(&self, trace_id: &str, phase: &str, deployment_id: i64) {
        info!(
            trace_id = %trace_id,
            flow = "Worker→Pipeline",
            stage = "PHASE→",
            phase = %phase,
            deployment_id = deployment_id,
            "[{}] [Worker→Pipeline] {} [PHASE→] deployment={}",
            trace_id, phase, deployment_id
        );
    }

    pub fn phase_done(&self, trace_id: &str, phase: &str, duration_ms: f64) {
        info!(
            trace_id = %trace_id,
            flow = "Worker→Pipeline",
            stage = "←DONE",
            phase = %phase,
            duration_ms = %duration_ms,
            "[{}] [Worker→Pipeline] {} [←DONE] {:.2}ms",
            trace_id, phase, duration_ms
        );
    }

    pub fn phase_error<E: std::fmt::Display>(&self, trace_id: &str, phase: &str, error: &E) {
        warn!(
            trace_id = %trace_id,
            flow = "Worker→Pipeline",
            stage = "←FAIL",
            phase = %phase,
            error = %error,
            "[{}] [Worker→Pipeline] {} [←FAIL] error={}",
            trace_id, phase, error
        );
    }

    pub fn event_emit(&self, trace_id: &str, from: &str, event_type: &str) {
        info!(
            trace_id = %trace_id,
            flow = format!("{}→EventBus", from),
            stage = "EVT↗",
            "[{}] [{}→EventBus] emit [EVT↗] {}",
            trace_id, from, event_type
        );
    }
}

impl Default for BoundaryLogger {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock timer for boundary durations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}
