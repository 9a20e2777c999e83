// HTTP API (routes, gateway check, error mapping)
pub mod api;

// Bearer token parsing and comparison
pub mod auth;

// Configuration loading
pub mod config;

// Token encryption and SQLite storage
pub mod credentials;

// Refresh, validation and audit orchestration
pub mod lifecycle;
