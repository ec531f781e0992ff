pub mod admission;
pub mod config;
pub mod engine;
pub mod error;
pub mod fail_fast;
pub mod logging;
pub mod routes;
pub mod session;
pub mod state;
pub mod test_util;
pub mod transcript;

pub use admission::{
    Admission, AdmissionGate, CapacityRegistry, InvalidTierPolicy, ReservationMode, SessionLease,
    Tier,
};
pub use config::Config;
pub use engine::{GenerationEngine, OllamaEngine};
pub use error::{Error, Result};
pub use fail_fast::FailFast;
pub use session::{FrameSink, SessionContext, SessionOutcome, SessionState, StreamingSession};
pub use state::AppState;
pub use transcript::{DisabledTranscripts, SqliteTranscriptStore, TranscriptStore};
