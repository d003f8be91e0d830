use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgemes_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use forgemes_events::Event;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkCenterId(pub AggregateId);

impl WorkCenterId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for WorkCenterId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: a machine line or station where batches run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCenter {
    id: WorkCenterId,
    code: String,
    name: String,
    active: bool,
    version: u64,
    created: bool,
}

impl WorkCenter {
    pub fn empty(id: WorkCenterId) -> Self {
        Self {
            id,
            code: String::new(),
            name: String::new(),
            active: false,
            version: 0,
            created: false,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl AggregateRoot for WorkCenter {
    type Id = WorkCenterId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateWorkCenter {
    pub work_center_id: WorkCenterId,
    pub code: String,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateWorkCenter {
    pub work_center_id: WorkCenterId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkCenterCommand {
    Create(CreateWorkCenter),
    Deactivate(DeactivateWorkCenter),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCenterCreated {
    pub work_center_id: WorkCenterId,
    pub code: String,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCenterDeactivated {
    pub work_center_id: WorkCenterId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Serialized untagged: the webhook payload is the inner event struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkCenterEvent {
    Created(WorkCenterCreated),
    Deactivated(WorkCenterDeactivated),
}

impl Event for WorkCenterEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WorkCenterEvent::Created(_) => "work_center.created",
            WorkCenterEvent::Deactivated(_) => "work_center.deactivated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            WorkCenterEvent::Created(e) => e.occurred_at,
            WorkCenterEvent::Deactivated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for WorkCenter {
    type Command = WorkCenterCommand;
    type Event = WorkCenterEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            WorkCenterEvent::Created(e) => {
                self.id = e.work_center_id;
                self.code = e.code.clone();
                self.name = e.name.clone();
                self.active = true;
                self.created = true;
            }
            WorkCenterEvent::Deactivated(_) => {
                self.active = false;
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            WorkCenterCommand::Create(cmd) => self.handle_create(cmd),
            WorkCenterCommand::Deactivate(cmd) => self.handle_deactivate(cmd),
        }
    }
}

impl WorkCenter {
    fn handle_create(&self, cmd: &CreateWorkCenter) -> Result<Vec<WorkCenterEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("work center already exists"));
        }
        if cmd.code.trim().is_empty() {
            return Err(DomainError::validation("code cannot be empty"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        Ok(vec![WorkCenterEvent::Created(WorkCenterCreated {
            work_center_id: cmd.work_center_id,
            code: cmd.code.trim().to_string(),
            name: cmd.name.trim().to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deactivate(&self, cmd: &DeactivateWorkCenter) -> Result<Vec<WorkCenterEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found("work center"));
        }
        if self.id != cmd.work_center_id {
            return Err(DomainError::invariant("work_center_id mismatch"));
        }
        if !self.active {
            return Err(DomainError::invariant("work center is already inactive"));
        }
        Ok(vec![WorkCenterEvent::Deactivated(WorkCenterDeactivated {
            work_center_id: cmd.work_center_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created() -> (WorkCenter, WorkCenterId) {
        let id = WorkCenterId::new(AggregateId::new());
        let mut wc = WorkCenter::empty(id);
        wc.execute(&WorkCenterCommand::Create(CreateWorkCenter {
            work_center_id: id,
            code: " WC-01 ".into(),
            name: "Filling line".into(),
            occurred_at: Utc::now(),
        }))
        .unwrap();
        (wc, id)
    }

    #[test]
    fn create_trims_and_activates() {
        let (wc, _) = created();
        assert_eq!(wc.code(), "WC-01");
        assert!(wc.is_active());
        assert_eq!(wc.version(), 1);
    }

    #[test]
    fn deactivate_twice_is_rejected() {
        let (mut wc, id) = created();
        let cmd = WorkCenterCommand::Deactivate(DeactivateWorkCenter {
            work_center_id: id,
            reason: Some("maintenance".into()),
            occurred_at: Utc::now(),
        });
        let events = wc.execute(&cmd).unwrap();
        assert_eq!(events[0].event_type(), "work_center.deactivated");
        assert!(matches!(wc.handle(&cmd), Err(DomainError::InvariantViolation(_))));
    }

    #[test]
    fn payload_is_the_inner_struct() {
        let (_, id) = created();
        let event = WorkCenterEvent::Deactivated(WorkCenterDeactivated {
            work_center_id: id,
            reason: None,
            occurred_at: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["work_center_id"], id.to_string());
    }
}
