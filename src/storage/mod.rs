pub mod database;
pub mod models;
pub mod session_db;

pub use database::Database;
pub use models::StoredSession;
pub use session_db::SessionDatabase;
