// src/config/mod.rs - Configuration Module Organization
// Tree location: ./src/config/mod.rs

//! Engine settings and integration parameters

pub mod settings;

pub use settings::{IntegrationConfig, Settings, DEFAULT_KERNEL_PATH};
