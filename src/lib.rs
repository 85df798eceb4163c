pub mod actions;
pub mod config;
pub mod definition;
pub mod error;
pub mod migration;
pub mod nodes;
pub mod runtime;
