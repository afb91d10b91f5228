//! jarvist-sync-agent: the edge-to-cloud data synchronization core.
//!
//! Two coupled subsystems, both built on top of the shared ledger (C1):
//! the ingest pipeline (C5, [`ingest`]) that discovers and decodes spool
//! records, and the durable publish queue (C4, [`queue`]) that forwards
//! them to the broker (C3, [`broker`]) with crash-safe buffering. The
//! [`control`] module exposes the in-process handle an admin surface would
//! drive; everything else in this crate is a supporting concern
//! (configuration, error taxonomy, environment detection).

pub mod broker;
pub mod config;
pub mod constants;
pub mod control;
pub mod decoder;
pub mod env;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod queue;

pub use config::Config;
pub use control::AgentHandle;
pub use ingest::IngestPipeline;
pub use ledger::{Repository, SqliteLedger};
pub use queue::PublishQueue;
