pub mod dispatcher;
pub mod dry_run;
pub mod executor;
pub mod idempotency;
pub mod memory;
pub mod model;
pub mod report;
pub mod repo;
pub mod scheduler;
pub mod store;
pub mod supervisor;
mod worker;

pub use executor::{AuditExecutor, ExecutorError, ExecutorKind, PhaseContext, PhaseOutcome};
pub use memory::MemoryJobStore;
pub use model::{Job, JobStatus, Phase, SubmitRequest};
pub use report::{FsReportSink, ReportSink};
pub use repo::JobsRepo;
pub use scheduler::{Scheduler, SchedulerConfig, SubmitOutcome};
pub use store::{JobStore, NewJob};
