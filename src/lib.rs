pub mod app;
pub mod artifact;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod migrator;
pub mod output;
pub mod scheduler;
pub mod storage;
pub mod transfer;
pub mod uploader;
