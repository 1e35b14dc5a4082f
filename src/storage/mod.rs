// Local persistence for connections, tabs and settings

pub mod connections;
pub mod database;
pub mod state;
pub mod tabs;

pub use connections::{ConnectionRegistry, NewConnection};
pub use database::{get_default_db_path, DatabaseManager, StorageError, StorageResult};
pub use state::PoolSettings;
pub use tabs::{CreateTabInput, Tab, TabType};
