// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 pgtunnel Contributors

//! SSH-forwarded database access.
//!
//! A [`TunnelManager`] owns one authenticated SSH transport and one local
//! listening port. Clients connect to the local port and are transparently
//! relayed, through a `direct-tcpip` channel per connection, to the fixed
//! database endpoint behind the SSH server. Establishment is lazy and
//! idempotent; teardown cancels and drains all live relay sessions.
//!
//! The forwarding engine runs against the [`transport::ForwardTransport`]
//! seam, so everything above the SSH layer can be exercised with in-memory
//! transports.

pub mod forward;
pub mod manager;
pub mod relay;
pub mod ssh;
pub mod transport;

pub use forward::{start_forwarding, Forwarder, SessionRegistry};
pub use manager::TunnelManager;
pub use relay::{copy_until_closed, DEFAULT_CHUNK_SIZE};
pub use ssh::SshConnector;
pub use transport::{BoxedStream, ForwardTransport, TransportConnector, TransportStream};

// Re-export the shared configuration and error types
pub use pgtunnel_common::{Error, Result, TunnelConfig};
