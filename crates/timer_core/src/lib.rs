pub mod clock;
pub mod domain;
pub mod ports;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::{
    AuditLog, LinkedEntity, PauseEntry, TimerAction, TimerDraft, TimerPatch, TimerSession,
    TimerStatus,
};
pub use ports::{PortError, PortResult, TimerStore, Transition};
pub use state::{TimerError, TimerResult};
