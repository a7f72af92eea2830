pub mod auth_context;
pub mod rate_limit;
