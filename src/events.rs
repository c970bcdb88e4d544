use serde::{Deserialize, Serialize};

use crate::db::{DeploymentStatus, LogStream};

/// Observer-facing notifications. Every variant is scoped to a repository so
/// subscribers can filter on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "webhook_received")]
    WebhookReceived {
        repository_id: i64,
        webhook_event_id: i64,
        provider: String,
        event_type: String,
        timestamp: String,
    },

    #[serde(rename = "build_queued")]
    BuildQueued {
        repository_id: i64,
        build_id: String,
        deployment_id: Option<i64>,
        timestamp: String,
    },

    #[serde(rename = "build_started")]
    BuildStarted {
        repository_id: i64,
        build_id: String,
        deployment_id: Option<i64>,
        timestamp: String,
    },

    #[serde(rename = "deployment_status")]
    DeploymentStatus {
        repository_id: i64,
        build_id: String,
        deployment_id: Option<i64>,
        status: DeploymentStatus,
        timestamp: String,
    },

    #[serde(rename = "log")]
    Log {
        repository_id: i64,
        build_id: String,
        deployment_id: Option<i64>,
        stream: LogStream,
        line: String,
        line_number: usize,
        timestamp: String,
    },

    #[serde(rename = "build_completed")]
    BuildCompleted {
        repository_id: i64,
        build_id: String,
        deployment_id: Option<i64>,
        timestamp: String,
    },

    #[serde(rename = "build_failed")]
    BuildFailed {
        repository_id: i64,
        build_id: String,
        deployment_id: Option<i64>,
        status: DeploymentStatus,
        error: String,
        timestamp: String,
    },
}

impl Event {
    pub fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    pub fn repository_id(&self) -> i64 {
        match self {
            Event::WebhookReceived { repository_id, .. }
            | Event::BuildQueued { repository_id, .. }
            | Event::BuildStarted { repository_id, .. }
            | Event::DeploymentStatus { repository_id, .. }
            | Event::Log { repository_id, .. }
            | Event::BuildCompleted { repository_id, .. }
            | Event::BuildFailed { repository_id, .. } => *repository_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::WebhookReceived { .. } => "WebhookReceived",
            Event::BuildQueued { .. } => "BuildQueued",
            Event::BuildStarted { .. } => "BuildStarted",
            Event::DeploymentStatus { .. } => "DeploymentStatus",
            Event::Log { .. } => "Log",
            Event::BuildCompleted { .. } => "BuildCompleted",
            Event::BuildFailed { .. } => "BuildFailed",
        }
    }

    pub fn webhook_received(
        repository_id: i64,
        webhook_event_id: i64,
        provider: String,
        event_type: String,
    ) -> Self {
        Event::WebhookReceived {
            repository_id,
            webhook_event_id,
            provider,
            event_type,
            timestamp: Self::now(),
        }
    }

    pub fn build_queued(repository_id: i64, build_id: &str, deployment_id: i64) -> Self {
        Event::BuildQueued {
            repository_id,
            build_id: build_id.to_string(),
            deployment_id: Some(deployment_id),
            timestamp: Self::now(),
        }
    }

    pub fn build_started(repository_id: i64, build_id: &str, deployment_id: i64) -> Self {
        Event::BuildStarted {
            repository_id,
            build_id: build_id.to_string(),
            deployment_id: Some(deployment_id),
            timestamp: Self::now(),
        }
    }

    pub fn deployment_status(
        repository_id: i64,
        build_id: &str,
        deployment_id: i64,
        status: DeploymentStatus,
    ) -> Self {
        Event::DeploymentStatus {
            repository_id,
            build_id: build_id.to_string(),
            deployment_id: Some(deployment_id),
            status,
            timestamp: Self::now(),
        }
    }

    pub fn log(
        repository_id: i64,
        build_id: &str,
        deployment_id: i64,
        stream: LogStream,
        line: String,
        line_number: usize,
    ) -> Self {
        Event::Log {
            repository_id,
            build_id: build_id.to_string(),
            deployment_id: Some(deployment_id),
            stream,
            line,
            line_number,
            timestamp: Self::now(),
        }
    }

    pub fn build_completed(repository_id: i64, build_id: &str, deployment_id: i64) -> Self {
        Event::BuildCompleted {
            repository_id,
            build_id: build_id.to_string(),
            deployment_id: Some(deployment_id),
            timestamp: Self::now(),
        }
    }

    pub fn build_failed(
        repository_id: i64,
        build_id: &str,
        deployment_id: i64,
        status: DeploymentStatus,
        error: String,
    ) -> Self {
        Event::BuildFailed {
            repository_id,
            build_id: build_id.to_string(),
            deployment_id: Some(deployment_id),
            status,
            error,
            timestamp: Self::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = Event::build_queued(7, "b-1", 3);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "build_queued");
        assert_eq!(json["repository_id"], 7);
        assert_eq!(json["deployment_id"], 3);
        assert_eq!(event.repository_id(), 7);
    }
}
