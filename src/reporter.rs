//! Grade reporting
//!
//! After a run finishes, the engine hands `(user, score, comment)` to the
//! reporter named on the test. Delivery is best effort: a failed report is
//! logged and the run stays as it is.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::debug;

use crate::error::ReportError;
use crate::storage::redis::keys;

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn file_report(&self, user: &str, score: f64, comment: &str) -> Result<(), ReportError>;
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    user: &'a str,
    score: f64,
    comment: &'a str,
}

/// Publishes reports on a Redis channel for an external gradebook bridge
pub struct RedisReporter {
    conn: ConnectionManager,
    channel: String,
}

impl RedisReporter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            channel: keys::REPORT_CHANNEL.to_string(),
        }
    }
}

#[async_trait]
impl Reporter for RedisReporter {
    async fn file_report(&self, user: &str, score: f64, comment: &str) -> Result<(), ReportError> {
        let json = serde_json::to_string(&Report {
            user,
            score,
            comment,
        })
        .map_err(|e| ReportError::Delivery(e.to_string()))?;

        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(&self.channel, &json)
            .await
            .map_err(|e| ReportError::Delivery(e.to_string()))?;
        debug!("Report for {} delivered to {} subscriber(s)", user, receivers);
        Ok(())
    }
}

/// Reporters by the name tests refer to them with
#[derive(Clone, Default)]
pub struct ReporterRegistry {
    reporters: HashMap<String, Arc<dyn Reporter>>,
}

impl ReporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, reporter: Arc<dyn Reporter>) {
        self.reporters.insert(name.into(), reporter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Reporter>> {
        self.reporters.get(name).cloned()
    }

    pub async fn file_report(
        &self,
        name: &str,
        user: &str,
        score: f64,
        comment: &str,
    ) -> Result<(), ReportError> {
        let reporter = self
            .get(name)
            .ok_or_else(|| ReportError::Unknown(name.to_string()))?;
        reporter.file_report(user, score, comment).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every report it receives
    #[derive(Default)]
    pub(crate) struct RecordingReporter {
        pub reports: Mutex<Vec<(String, f64, String)>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Reporter for RecordingReporter {
        async fn file_report(&self, user: &str, score: f64, comment: &str) -> Result<(), ReportError> {
            self.reports
                .lock()
                .unwrap()
                .push((user.to_string(), score, comment.to_string()));
            if self.fail {
                return Err(ReportError::Delivery("gradebook offline".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let recorder = Arc::new(RecordingReporter::default());
        let mut registry = ReporterRegistry::new();
        registry.register("lms", recorder.clone());

        registry.file_report("lms", "alice", 7.0, "ok").await.unwrap();
        assert_eq!(
            recorder.reports.lock().unwrap().as_slice(),
            &[("alice".to_string(), 7.0, "ok".to_string())]
        );

        let err = registry.file_report("moodle", "alice", 7.0, "ok").await.unwrap_err();
        assert!(matches!(err, ReportError::Unknown(_)));
    }
}
