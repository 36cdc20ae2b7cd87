//! Durable storage of merged records.

use crate::entities::AircraftLiveRecord;
use crate::entities::aircraft_live::{GetAircraftLiveByHex, UpsertAircraftLive};
use crate::framework::DatabaseProcessor;
use async_trait::async_trait;
use compact_str::CompactString;
use kanau::processor::Processor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// The system of record for merged aircraft state.
#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn get(&self, hex: &str) -> Result<Option<AircraftLiveRecord>, RepositoryError>;

    async fn upsert(&self, record: &AircraftLiveRecord) -> Result<(), RepositoryError>;
}

pub type SharedRepository = Arc<dyn StateRepository>;

pub struct PgStateRepository {
    db: DatabaseProcessor,
}

impl PgStateRepository {
    pub fn new(db: DatabaseProcessor) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StateRepository for PgStateRepository {
    async fn get(&self, hex: &str) -> Result<Option<AircraftLiveRecord>, RepositoryError> {
        let record = self
            .db
            .process(GetAircraftLiveByHex {
                hex: CompactString::from(hex),
            })
            .await?;
        Ok(record)
    }

    async fn upsert(&self, record: &AircraftLiveRecord) -> Result<(), RepositoryError> {
        self.db
            .process(UpsertAircraftLive {
                record: record.clone(),
            })
            .await?;
        Ok(())
    }
}

/// Unbounded in-process store for `storage = "memory"` and tests.
#[derive(Default)]
pub struct MemoryStateRepository {
    records: RwLock<HashMap<CompactString, AircraftLiveRecord>>,
}

impl MemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateRepository for MemoryStateRepository {
    async fn get(&self, hex: &str) -> Result<Option<AircraftLiveRecord>, RepositoryError> {
        Ok(self.records.read().get(hex).cloned())
    }

    async fn upsert(&self, record: &AircraftLiveRecord) -> Result<(), RepositoryError> {
        self.records
            .write()
            .insert(record.hex.clone(), record.clone());
        Ok(())
    }
}
