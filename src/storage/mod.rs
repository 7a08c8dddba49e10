//! Storage port
//!
//! The engine reads tests, submissions and files through `Store` and writes
//! nothing but finished runs. CRUD for those records belongs to whoever
//! implements the trait.

pub mod blob;
pub mod redis;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{File, Run, Submission, Test};

pub use blob::BlobStore;
pub use self::redis::{QueueMessage, RedisStore, RunQueue};

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_test(&self, id: &str) -> Result<Test, StoreError>;
    async fn get_submission(&self, id: &str) -> Result<Submission, StoreError>;
    async fn get_file(&self, id: &str) -> Result<File, StoreError>;
    /// Persist a run; saving the same record twice leaves one identical copy
    async fn save_run(&self, run: &Run) -> Result<(), StoreError>;
}

/// In-process store, used by tests and single-host setups
#[derive(Debug, Default)]
pub struct MemoryStore {
    tests: DashMap<String, Test>,
    submissions: DashMap<String, Submission>,
    files: DashMap<String, File>,
    runs: DashMap<Uuid, Run>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_test(&self, test: Test) {
        self.tests.insert(test.id.clone(), test);
    }

    pub fn put_submission(&self, submission: Submission) {
        self.submissions.insert(submission.id.clone(), submission);
    }

    pub fn put_file(&self, file: File) {
        self.files.insert(file.id.clone(), file);
    }

    pub fn run(&self, id: &Uuid) -> Option<Run> {
        self.runs.get(id).map(|r| r.clone())
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

fn not_found(kind: &'static str, id: &str) -> StoreError {
    StoreError::NotFound {
        kind,
        id: id.to_string(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_test(&self, id: &str) -> Result<Test, StoreError> {
        self.tests
            .get(id)
            .map(|t| t.clone())
            .ok_or_else(|| not_found("test", id))
    }

    async fn get_submission(&self, id: &str) -> Result<Submission, StoreError> {
        self.submissions
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| not_found("submission", id))
    }

    async fn get_file(&self, id: &str) -> Result<File, StoreError> {
        self.files
            .get(id)
            .map(|f| f.clone())
            .ok_or_else(|| not_found("file", id))
    }

    async fn save_run(&self, run: &Run) -> Result<(), StoreError> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }
}
