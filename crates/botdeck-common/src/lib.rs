//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the botdeck runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the botdeck workspace.
//! This crate exposes configuration loading, tracing initialisation, and the
//! small formatting helpers used by both the controller and the daemon.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, AuthConfig, ClientConfig, ControllerConfig, DeployConfig, LoadedAppConfig,
    LoggingConfig, MetricsConfig, ServerConfig, TokenGrant,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{format_file_size, format_uptime};
