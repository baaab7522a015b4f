pub mod ledger;
#[cfg(test)]
pub(crate) mod mock;
pub mod orchestrator;
pub mod resolver;
pub mod worker;
pub mod writer;

pub use self::ledger::RunLedger;
pub use self::orchestrator::{Pipeline, RunReport, TableReport};
pub use self::resolver::{DependencyResolver, Resolution};
pub use self::worker::{RecordOutcome, RecordWorker};
pub use self::writer::PersistenceWriter;
