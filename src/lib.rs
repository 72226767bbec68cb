pub mod archive;
pub mod clock;
pub mod config;
pub mod context;
pub mod errors;
pub mod executor;
pub mod human_loop;
pub mod logging;
pub mod phase;
pub mod report;
pub mod session;
pub mod store;
pub mod worker;

pub use archive::{MasterArchive, merge, replay};
pub use config::DossierConfig;
pub use errors::{AnalysisError, SessionError, StoreError};
pub use executor::{AnalysisContext, AnalysisOutput, AnalysisStage, Analyzer, HumanInput};
pub use human_loop::{Channel, HumanLoopRequest, Notifier, RequestStatus};
pub use phase::{PhaseDef, PhaseRegistry, PhaseResult};
pub use session::{Checkpoint, CheckpointReason, Session, SessionManager, SessionStatus};
pub use worker::Worker;
