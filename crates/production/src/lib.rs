//! Production domain module.
//!
//! Work centers, production batches and serialized product units. Pure
//! decision logic: commands in, events out. Persistence and event publication
//! happen in the caller's unit-of-work.

pub mod batch;
pub mod catalog;
pub mod product;
pub mod work_center;

pub use batch::{Batch, BatchClosed, BatchCommand, BatchCreated, BatchEvent, BatchId, BatchStatus, CloseBatch, CreateBatch};
pub use catalog::event_catalog;
pub use product::{
    AggregateProduct, CreateProduct, Product, ProductAggregated, ProductCommand, ProductCreated, ProductEvent,
    ProductId,
};
pub use work_center::{
    CreateWorkCenter, DeactivateWorkCenter, WorkCenter, WorkCenterCommand, WorkCenterCreated,
    WorkCenterDeactivated, WorkCenterEvent, WorkCenterId,
};
