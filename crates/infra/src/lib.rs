//! Infrastructure layer: storage with after-commit hooks, the background
//! task queue, notification delivery, configuration and process lifecycle.

pub mod config;
pub mod db;
pub mod lifecycle;
pub mod mail;
pub mod tasks;
