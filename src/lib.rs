//! # repfs
//!
//! A replicated, rebalancing distributed file store:
//! - one controller tracking membership, placement and quorums
//! - storage nodes holding the file replicas on local disk
//! - direct client↔node and node↔node byte transfers (the controller
//!   never touches file contents)
//! - periodic rebalancing that repairs replication and evens out load
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────────────────────┐
//!                │          Controller          │
//!                │  membership · allocation     │
//!                │  quorums · rebalance engine  │
//!                └──────┬───────┬───────┬───────┘
//!                       │ control links │
//!             ┌─────────┴──┐ ┌──┴───────┐ ┌┴───────────┐
//!             │  Node 9001 │ │ Node 9002│ │ Node 9003  │
//!             │  (blobs)   │◄┼──────────┼►│  (blobs)   │
//!             └──────▲─────┘ └────▲─────┘ └─────▲──────┘
//!                    └───────────┬┴──────────────┘
//!                                │ file bytes
//!                             Client
//! ```
//!
//! ## Usage
//!
//! ### Start the controller
//! ```bash
//! repfs-controller serve --bind 0.0.0.0:4000 --replication 3 \
//!   --timeout-ms 3000 --rebalance-period-ms 30000
//! ```
//!
//! ### Start a storage node
//! ```bash
//! repfs-node --bind 0.0.0.0:4101 --controller 127.0.0.1:4000 \
//!   --data-dir ./node-data
//! ```
//!
//! ### Use the CLI
//! ```bash
//! repfs store report.pdf --controller 127.0.0.1:4000
//! repfs load report.pdf --output ./report.pdf
//! repfs list
//! repfs remove report.pdf
//! ```

pub mod client;
pub mod common;
pub mod controller;
pub mod node;

// Re-export commonly used types
pub use client::Client;
pub use common::{ControllerConfig, Error, NodeConfig, Result};
pub use controller::{Controller, ControllerHandle};
pub use node::{NodeServer, RunningNode};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
