//! Job lifecycle for planctx.
//!
//! - [`JobLifecycleManager`] owns the state machine and turns every change
//!   into a compare-and-transition on a [`JobStore`]
//! - [`JobExecutor`] claims jobs and runs registered [`JobHandler`]s
//! - stores: [`InMemoryJobStore`] and, with the `sqlite` feature, [`SqliteJobStore`]

pub mod executor;
pub mod in_memory;
pub mod lifecycle;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use executor::{HandlerError, JobExecutor, JobHandler, JobOutput};
pub use in_memory::InMemoryJobStore;
pub use lifecycle::{JobEvent, JobLifecycleManager};
pub use planctx_core::job::JobStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;
