//! # VaultLink Daemon Library
//!
//! This crate provides both halves of the VaultLink browser bridge: the
//! native-messaging proxy that the browser launches, and the Unix-socket
//! server that a credential store embeds to answer extension requests.
//!
//! ## Overview
//!
//! - **Relay**: bridges the browser's length-prefixed stdio framing to the
//!   store's newline-delimited socket, reconnecting while the store is away
//! - **Server**: accepts extension connections and runs one dispatcher per
//!   connection
//! - **Dispatcher**: performs the key exchange, decrypts requests, and
//!   routes them to the embedding store's [`store::CredentialStore`]
//! - **Config**: TOML configuration with environment overrides
//!
//! ## Architecture
//!
//! ```text
//!  browser extension
//!        │  stdio, length-prefixed frames
//!  ┌─────▼──────────┐
//!  │ vaultlink-proxy│   relay
//!  └─────┬──────────┘
//!        │  Unix socket, newline-delimited JSON
//!  ┌─────▼──────────┐
//!  │  BridgeServer  │   one ActionDispatcher per connection
//!  └─────┬──────────┘
//!        │  CredentialStore trait
//!  ┌─────▼──────────┐
//!  │ embedding app  │   database access, prompts, generator UI
//!  └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use daemon::config::Config;
//! use daemon::server::{get_socket_path, BridgeServer};
//!
//! # fn collaborators() -> (Arc<dyn daemon::store::CredentialStore>, Arc<dyn daemon::store::BridgeSettings>) { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let (store, settings) = collaborators();
//!
//!     let server = BridgeServer::bind(&get_socket_path()).await?;
//!     server
//!         .run(store, settings, config.proxy.max_message_size)
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod relay;
pub mod server;
pub mod store;

pub use config::Config;
pub use dispatch::ActionDispatcher;
pub use relay::{run_relay, RelayConfig};
pub use server::{get_socket_path, serve_connection, BridgeServer};
pub use store::{BridgeSettings, CredentialStore, GeneratorPrompt};
