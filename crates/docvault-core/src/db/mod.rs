//! Database layer: connection management, migrations, and the local store.

pub mod connection;
pub mod migrations;
pub mod store;

pub use connection::Database;
pub use store::LocalStore;
