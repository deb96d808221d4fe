pub mod config;
pub mod database;
pub mod rate_limit_store;

pub use config::DatabaseConfig;
pub use database::Database;
pub use rate_limit_store::PgRateLimitStore;
