pub mod app;
pub mod bindings;
pub mod chain_builder;
pub mod config;
pub mod fsutil;
pub mod host;
pub mod integrity;
pub mod layout;
pub mod ledger;
pub mod loader;
pub mod observability;
pub mod process;
pub mod report;
pub mod resolver;
pub mod safe_mode;
pub mod subsystem;
