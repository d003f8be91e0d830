use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgemes_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use forgemes_events::Event;

use crate::work_center::WorkCenterId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub AggregateId);

impl BatchId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for BatchId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Open,
    Closed,
}

/// Aggregate root: a production lot run on one work center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    id: BatchId,
    work_center_id: Option<WorkCenterId>,
    lot_number: String,
    planned_quantity: u32,
    produced_quantity: u32,
    status: BatchStatus,
    version: u64,
    created: bool,
}

impl Batch {
    pub fn empty(id: BatchId) -> Self {
        Self {
            id,
            work_center_id: None,
            lot_number: String::new(),
            planned_quantity: 0,
            produced_quantity: 0,
            status: BatchStatus::Open,
            version: 0,
            created: false,
        }
    }

    pub fn work_center_id(&self) -> Option<WorkCenterId> {
        self.work_center_id
    }

    pub fn lot_number(&self) -> &str {
        &self.lot_number
    }

    pub fn planned_quantity(&self) -> u32 {
        self.planned_quantity
    }

    pub fn produced_quantity(&self) -> u32 {
        self.produced_quantity
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }
}

impl AggregateRoot for Batch {
    type Id = BatchId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBatch {
    pub batch_id: BatchId,
    pub work_center_id: WorkCenterId,
    pub lot_number: String,
    pub planned_quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseBatch {
    pub batch_id: BatchId,
    pub produced_quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchCommand {
    Create(CreateBatch),
    Close(CloseBatch),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCreated {
    pub batch_id: BatchId,
    pub work_center_id: WorkCenterId,
    pub lot_number: String,
    pub planned_quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchClosed {
    pub batch_id: BatchId,
    pub planned_quantity: u32,
    pub produced_quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchEvent {
    Created(BatchCreated),
    Closed(BatchClosed),
}

impl Event for BatchEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BatchEvent::Created(_) => "batch.created",
            BatchEvent::Closed(_) => "batch.closed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BatchEvent::Created(e) => e.occurred_at,
            BatchEvent::Closed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Batch {
    type Command = BatchCommand;
    type Event = BatchEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            BatchEvent::Created(e) => {
                self.id = e.batch_id;
                self.work_center_id = Some(e.work_center_id);
                self.lot_number = e.lot_number.clone();
                self.planned_quantity = e.planned_quantity;
                self.status = BatchStatus::Open;
                self.created = true;
            }
            BatchEvent::Closed(e) => {
                self.produced_quantity = e.produced_quantity;
                self.status = BatchStatus::Closed;
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            BatchCommand::Create(cmd) => self.handle_create(cmd),
            BatchCommand::Close(cmd) => self.handle_close(cmd),
        }
    }
}

impl Batch {
    fn handle_create(&self, cmd: &CreateBatch) -> Result<Vec<BatchEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("batch already exists"));
        }
        if cmd.lot_number.trim().is_empty() {
            return Err(DomainError::validation("lot number cannot be empty"));
        }
        if cmd.planned_quantity == 0 {
            return Err(DomainError::validation("planned quantity must be positive"));
        }
        Ok(vec![BatchEvent::Created(BatchCreated {
            batch_id: cmd.batch_id,
            work_center_id: cmd.work_center_id,
            lot_number: cmd.lot_number.trim().to_string(),
            planned_quantity: cmd.planned_quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_close(&self, cmd: &CloseBatch) -> Result<Vec<BatchEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found("batch"));
        }
        if self.id != cmd.batch_id {
            return Err(DomainError::invariant("batch_id mismatch"));
        }
        if self.status == BatchStatus::Closed {
            return Err(DomainError::invariant("batch is already closed"));
        }
        Ok(vec![BatchEvent::Closed(BatchClosed {
            batch_id: cmd.batch_id,
            planned_quantity: self.planned_quantity,
            produced_quantity: cmd.produced_quantity,
            occurred_at: cmd.occurred_at,
        })])
    }
}
