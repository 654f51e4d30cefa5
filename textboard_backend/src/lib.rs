pub mod bans;
pub mod banwords;
pub mod bootstrap;
pub mod cli;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod filters;
pub mod identity;
pub mod kv;
pub mod moderation;
pub mod node;
pub mod pipeline;
pub mod posting;
pub mod rate_limiter;
pub mod scope;
pub mod tasks;
pub mod telemetry;
pub mod utils;
