//! Adapt Signal (adapt-signal)
//!
//! Request-scoped reactive state:
//! 1. **Signal Store**: typed cells with monotonically increasing versions
//! 2. **Effect Scheduler**: dependency-tracked re-execution, gated by phase
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use adapt_signal::prelude::*;
//!
//! let mut store = SignalStore::new();
//! let path = store.define(SignalKey::new(SignalDomain::Request, "path"), "/blog".into())?;
//!
//! let mut scheduler: EffectScheduler<Ctx> = EffectScheduler::new(8);
//! scheduler.register("log-path", Phase::Observe, Box::new(move |ctx: &mut Ctx| {
//!     let _ = ctx.signals().get(path)?;
//!     Ok(())
//! }));
//! scheduler.flush(Phase::Observe, &mut ctx)?;
//! ```

pub mod effect;
pub mod error;
pub mod phase;
pub mod store;
pub mod value;

pub use effect::{EffectFault, EffectFn, EffectHost, EffectId, EffectScheduler, FlushReport};
pub use error::{SchedulerError, SignalError};
pub use phase::Phase;
pub use store::{Signal, SignalDomain, SignalId, SignalKey, SignalStore};
pub use value::{BodyHandle, BodySource, ChunkIter, SignalType, SignalValue};

/// Common imports for working with signals and effects
pub mod prelude {
    pub use crate::effect::{EffectFault, EffectHost, EffectScheduler, FlushReport};
    pub use crate::error::{SchedulerError, SignalError};
    pub use crate::phase::Phase;
    pub use crate::store::{Signal, SignalDomain, SignalId, SignalKey, SignalStore};
    pub use crate::value::{BodyHandle, SignalType, SignalValue};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
