//! Repository layer for database access.
//!
//! Each concern gets its own trait so the runtime can be driven by test
//! doubles; [`Store`] bundles them into the single capability handed to the
//! integration runtime and the danmaku consumer.

pub mod delivery;
pub mod event;
pub mod settings;
pub mod task;

pub use delivery::*;
pub use event::*;
pub use settings::*;
pub use task::*;

use crate::database::{DbPool, WritePool};

/// Everything the runtime needs from persistence.
pub trait Store:
    TaskRepository + DeliveryLogRepository + SettingsRepository + EventRepository
{
}

impl<T> Store for T where
    T: TaskRepository + DeliveryLogRepository + SettingsRepository + EventRepository
{
}

/// SQLite-backed implementation of every repository trait.
#[derive(Clone)]
pub struct SqlxStore {
    pool: DbPool,
    /// Serialized pool for every write, including `BEGIN IMMEDIATE` leases.
    write_pool: WritePool,
}

impl SqlxStore {
    /// The same pool may be passed twice; the lease then shares it.
    pub fn new(pool: DbPool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}
