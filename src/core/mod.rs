//! Turn Execution Core
//!
//! The deterministic heart of the service: the entropy stream, the dice
//! evaluator, the session lock lease, the preview/commit turn protocol,
//! the ad-hoc roll service, and the live-update fan-out.

pub mod autosave;
pub mod dice;
pub mod entropy;
pub mod error;
pub mod events;
pub mod highlights;
pub mod llm;
pub mod lock;
pub mod logging;
pub mod narration;
pub mod roll;
pub mod state;
pub mod turn;

pub use error::{EngineError, EngineResult};
