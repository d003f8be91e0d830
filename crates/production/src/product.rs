use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgemes_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use forgemes_events::Event;

use crate::batch::BatchId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub AggregateId);

impl ProductId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: one serialized unit (item, case, pallet).
///
/// Units are packed into parent units through aggregation. A unit has at most
/// one parent and cannot be re-packed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    id: ProductId,
    batch_id: Option<BatchId>,
    serial: String,
    parent_id: Option<ProductId>,
    version: u64,
    created: bool,
}

impl Product {
    pub fn empty(id: ProductId) -> Self {
        Self {
            id,
            batch_id: None,
            serial: String::new(),
            parent_id: None,
            version: 0,
            created: false,
        }
    }

    pub fn batch_id(&self) -> Option<BatchId> {
        self.batch_id
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn parent_id(&self) -> Option<ProductId> {
        self.parent_id
    }
}

impl AggregateRoot for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProduct {
    pub product_id: ProductId,
    pub batch_id: BatchId,
    pub serial: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateProduct {
    pub product_id: ProductId,
    pub parent_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductCommand {
    Create(CreateProduct),
    Aggregate(AggregateProduct),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub product_id: ProductId,
    pub batch_id: BatchId,
    pub serial: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductAggregated {
    pub product_id: ProductId,
    pub parent_id: ProductId,
    pub serial: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProductEvent {
    Created(ProductCreated),
    Aggregated(ProductAggregated),
}

impl Event for ProductEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ProductEvent::Created(_) => "product.created",
            ProductEvent::Aggregated(_) => "product.aggregated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ProductEvent::Created(e) => e.occurred_at,
            ProductEvent::Aggregated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Product {
    type Command = ProductCommand;
    type Event = ProductEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ProductEvent::Created(e) => {
                self.id = e.product_id;
                self.batch_id = Some(e.batch_id);
                self.serial = e.serial.clone();
                self.created = true;
            }
            ProductEvent::Aggregated(e) => {
                self.parent_id = Some(e.parent_id);
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ProductCommand::Create(cmd) => self.handle_create(cmd),
            ProductCommand::Aggregate(cmd) => self.handle_aggregate(cmd),
        }
    }
}

impl Product {
    fn handle_create(&self, cmd: &CreateProduct) -> Result<Vec<ProductEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("product already exists"));
        }
        let serial = cmd.serial.trim();
        if serial.is_empty() {
            return Err(DomainError::validation("serial cannot be empty"));
        }
        if serial.chars().any(char::is_whitespace) {
            return Err(DomainError::validation("serial cannot contain whitespace"));
        }
        Ok(vec![ProductEvent::Created(ProductCreated {
            product_id: cmd.product_id,
            batch_id: cmd.batch_id,
            serial: serial.to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_aggregate(&self, cmd: &AggregateProduct) -> Result<Vec<ProductEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found("product"));
        }
        if self.id != cmd.product_id {
            return Err(DomainError::invariant("product_id mismatch"));
        }
        if cmd.parent_id == self.id {
            return Err(DomainError::invariant("a unit cannot be packed into itself"));
        }
        if let Some(parent) = self.parent_id {
            return Err(DomainError::conflict(format!("unit already packed into {parent}")));
        }
        Ok(vec![ProductEvent::Aggregated(ProductAggregated {
            product_id: cmd.product_id,
            parent_id: cmd.parent_id,
            serial: self.serial.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(serial: &str) -> Product {
        let id = ProductId::new(AggregateId::new());
        let mut p = Product::empty(id);
        p.execute(&ProductCommand::Create(CreateProduct {
            product_id: id,
            batch_id: BatchId::new(AggregateId::new()),
            serial: serial.into(),
            occurred_at: Utc::now(),
        }))
        .unwrap();
        p
    }

    #[test]
    fn aggregate_sets_parent_once() {
        let mut child = unit("SN-0001");
        let case = ProductId::new(AggregateId::new());
        let cmd = ProductCommand::Aggregate(AggregateProduct {
            product_id: *child.id(),
            parent_id: case,
            occurred_at: Utc::now(),
        });

        let events = child.execute(&cmd).unwrap();
        assert_eq!(events[0].event_type(), "product.aggregated");
        assert_eq!(child.parent_id(), Some(case));
        assert!(matches!(child.handle(&cmd), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn cannot_pack_into_itself() {
        let child = unit("SN-0002");
        let res = child.handle(&ProductCommand::Aggregate(AggregateProduct {
            product_id: *child.id(),
            parent_id: *child.id(),
            occurred_at: Utc::now(),
        }));
        assert!(matches!(res, Err(DomainError::InvariantViolation(_))));
    }

    #[test]
    fn serial_with_spaces_is_invalid() {
        let id = ProductId::new(AggregateId::new());
        let res = Product::empty(id).handle(&ProductCommand::Create(CreateProduct {
            product_id: id,
            batch_id: BatchId::new(AggregateId::new()),
            serial: "SN 1".into(),
            occurred_at: Utc::now(),
        }));
        assert!(matches!(res, Err(DomainError::Validation(_))));
    }
}
