pub mod app;
pub mod config;
pub mod db;
pub mod diff;
pub mod enrollment;
pub mod error;
pub mod message;
pub mod model;
pub mod notifier;
pub mod parser;
pub mod scheduler;
pub mod source;
pub mod updater;
