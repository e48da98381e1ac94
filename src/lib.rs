pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod loader;
pub mod output;
pub mod pipeline;
pub mod records;
pub mod remote;
pub mod scoring;
pub mod store;
pub mod tool;
pub mod uid;
