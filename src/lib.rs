// Environment-based configuration
pub mod config;

// Upstream API client (retry, batching)
pub mod api;

// Postgres store, migrations, partition provisioning
pub mod db;

// Periodic ingestion loops
pub mod scraper;

// Health/readiness HTTP endpoints
pub mod health;
