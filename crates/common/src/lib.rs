// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 pgtunnel Contributors

// pgtunnel - Common Library
// Shared configuration, error types, and connection-URL utilities

pub mod config;
pub mod db;
pub mod error;
pub mod network;

pub use config::{
    DatabaseConfig, SecretString, SshConfig, SshCredential, TunnelConfig, TunnelOptions,
    DEFAULT_DATABASE_PORT, DEFAULT_SSH_PORT,
};
pub use db::database_url;
pub use error::{Error, Result};
pub use network::format_host_port;
