//! PostgreSQL persistence for the authoritative store.

mod pool;
mod remote;
mod rows;

pub use pool::*;
pub use remote::PgRemoteStore;
