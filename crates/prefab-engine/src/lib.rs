//! prefab-engine — converges a host to the state described by a manifest.
//!
//! The engine is sequential and phase-ordered; the only parallelism is the
//! fetch pool that downloads package archives before installation.

pub mod command;
pub mod config;
pub mod driver;
pub mod engine;
pub mod fetch;
pub mod host;
pub mod staleness;

pub use command::{CommandOutput, CommandRunner};
pub use config::EngineConfig;
pub use driver::HostDriver;
pub use engine::{ConvergeReport, Engine};
pub use fetch::{fetch_all, FetchPool, FetchReport, FetchSettings, Fetcher, HttpFetcher};
pub use host::SystemHost;
pub use staleness::{Clock, FileMarker, Freshness, MarkerStore, StalenessCache, SystemClock};
