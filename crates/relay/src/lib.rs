//! Failover relay core
//!
//! Turns one OpenAI-shaped chat request into upstream attempts across the
//! cookie pool and re-emits whichever attempt wins as a canonical delta
//! stream. `StreamTranslator` reshapes one attempt's events;
//! `Orchestrator` owns the attempt loop and the pool side effects.

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod translator;

pub use error::{RelayError, Result};
pub use events::{Completion, DeltaEvent, Usage};
pub use orchestrator::{Orchestrator, RelayRequest};
pub use translator::{Signal, StreamTranslator, Translated};
