pub mod autoscaler;
pub mod batch;
pub mod config;
pub mod cost;
pub mod dispatcher;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod provision;
pub mod queue;
pub mod request;
pub mod service;
pub mod worker;

pub use autoscaler::{Autoscaler, CapacityPlan, FleetObservation};
pub use batch::{Batch, BatchId, Batcher};
pub use config::DispatchConfig;
pub use dispatcher::Dispatcher;
pub use error::{AdmissionReason, DispatchError, Result};
pub use inference::{InferenceBackend, SimulatedBackend, Transcript};
pub use metrics::DispatchMetrics;
pub use provision::{Provisioner, SimProvisioner, WorkerEvent};
pub use queue::{AdmissionQueue, QueueDepth};
pub use request::{Priority, Request, RequestId, RequestOutcome, RequestRecord, RequestStatus};
pub use service::{DispatchService, ServiceHealth, SubmitReceipt, SubmitRequest};
pub use worker::{ClassProfile, FleetProfile, FleetRegistry, WorkerClass, WorkerDescriptor, WorkerId};
