//! Client side of heapsight.
//!
//! Snapshots are parsed and indexed in a worker; this crate talks to it.
//! [`WorkerClient`] multiplexes calls over one transport and watches for
//! calls that take too long. The proxies in [`proxy`] give each worker
//! object a typed handle, and [`grids`] turns them into the constructors,
//! comparison, allocation and object-tree views.
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use heapsight::grids::ConstructorsGrid;
//! use heapsight::{ClientConfig, WorkerClient, load_snapshot_from_file};
//! use heapsight_types::ProfileUid;
//!
//! let client = WorkerClient::spawn_thread("main", ClientConfig::from_env(), |_| {})?;
//! let uid = ProfileUid::new(1)?;
//! let snapshot = Arc::new(load_snapshot_from_file(&client, Path::new("app.heapsnapshot"), uid).await?);
//!
//! let mut grid = ConstructorsGrid::new(Default::default());
//! grid.set_data_source(snapshot.clone())?;
//! grid.next_aggregates().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod coalesce;
mod config;
mod error;
pub mod grids;
pub mod proxy;
mod transport;

pub use client::WorkerClient;
pub use coalesce::{Completion, FilterCoalescer};
pub use config::ClientConfig;
pub use error::{GridError, LoadError, RpcError};
pub use heapsight_wire::WorkerEvent;
pub use proxy::{
    LoaderProxy, ProviderProxy, SnapshotProxy, load_snapshot_from_file, load_snapshot_from_reader,
};
pub use transport::{ThreadWorker, WorkerTransport};
