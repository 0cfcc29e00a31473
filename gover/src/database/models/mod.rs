//! Database models.

pub mod delivery;
pub mod event;
pub mod settings;
pub mod task;

pub use delivery::*;
pub use event::*;
pub use settings::*;
pub use task::*;
