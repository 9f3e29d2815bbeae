//! Puente de escritura entre un framework batch multi-engine y un warehouse
//! columnar: codec de valores, job descriptor, task writer, protocolo de
//! commit por engine y limpieza. También los DTOs HTTP de master/worker.

pub mod cleanup;
pub mod commit;
pub mod config;
pub mod convert;
pub mod descriptor;
pub mod error;
pub mod input;
pub mod job;
pub mod paths;
pub mod schema;
pub mod setup;
pub mod side_file;
pub mod staged;
pub mod task;
pub mod temporal;
pub mod trigger;
pub mod value;
pub mod warehouse;
pub mod worker;
pub mod writer;

pub use commit::{CommitCoordinator, CommitOutcome, CommitState};
pub use config::{ExecutionEngine, JobConfig, JobConfigBuilder, WriteStrategy};
pub use descriptor::{DescriptorLocation, JobDescriptor};
pub use error::{ConnectorError, Result};
pub use job::{JobId, JobInfo, JobStatus, WriteJobRequest};
pub use schema::{FieldMode, FieldSchema, FieldType, TableId, TableSchema};
pub use task::{OutputArtifact, Task, TaskId, TaskOutputRecord};
pub use trigger::{select_trigger, CommitTrigger};
pub use value::{Decimal, Row, Value, WarehouseRow, WarehouseValue};
pub use warehouse::{LocalWarehouse, TableStatistics, WarehouseClient};
pub use worker::{
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
