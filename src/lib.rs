//! Goal-directed browsing automation.
//!
//! A [`Copilot`] turns a natural-language request into a bounded sequence of
//! page actions against a [`PageHost`], asks an [`Oracle`] whether the goal
//! is met, and remembers successful sequences as replayable skills.

pub mod actions;
pub mod config;
pub mod copilot;
pub mod dom;
pub mod error;
pub mod events;
pub mod followup;
pub mod oracle;
pub mod reply;
pub mod resolve;
pub mod skills;
pub mod store;
pub mod surface;
pub mod types;
pub mod visits;

pub use config::{EngineConfig, SkillLimits};
pub use copilot::{Copilot, TurnOutcome, TurnStatus};
pub use error::{EngineError, HostError, OracleError, Result, StoreError};
pub use events::EngineEvent;
pub use oracle::Oracle;
pub use skills::{SkillEntry, SkillMemory};
pub use store::{JsonFileStore, MemoryStore, RecordStore};
pub use surface::{LifecycleEvent, PageHost};
pub use visits::{VisitMemory, VisitRecord};
