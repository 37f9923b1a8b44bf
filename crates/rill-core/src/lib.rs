//! Core rill engine (session loop, executor, streaming, catalog, config).

pub mod catalog;
pub mod config;
pub mod exec;
pub mod history;
pub mod logging;
pub mod providers;
pub mod session;
pub mod stream;
