//! Configuration module for tether.
//!
//! Handles the config file, environment variables, and worker settings.

mod settings;

pub use settings::{
    expand_env_vars, ClientSettings, ProvisionSettings, Settings, SettingsError, WorkerSettings,
    CONFIG_ENV,
};
