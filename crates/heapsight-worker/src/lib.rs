//! The isolated side of heapsight.
//!
//! A worker owns loaders, snapshots and providers, all addressed by
//! [`ObjectId`]. It parses the JSON heap snapshot layout, builds the indexes
//! the views need (retainers, distances, dominator tree, retained sizes), and
//! answers [`heapsight_wire`] requests against them.

use std::error::Error;
use std::fmt;

use heapsight_types::{ObjectId, ProfileUid};

mod aggregates;
mod allocation;
mod dispatch;
mod format;
mod host;
mod loader;
mod provider;
mod snapshot;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use dispatch::Dispatcher;
pub use host::{WorkerThread, serve};
pub use loader::SnapshotLoader;
pub use provider::Provider;
pub use snapshot::HeapSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    UnknownObject(ObjectId),
    WrongObjectKind {
        object_id: ObjectId,
        expected: &'static str,
        found: &'static str,
        method: &'static str,
    },
    Parse(String),
    LoaderClosed,
    LoaderNotClosed,
    UnknownBaseSnapshot(ProfileUid),
    NodeIndexOutOfRange(u32),
    InvalidSearch(String),
    ProbeFailed(String),
    Spawn(String),
    Terminated,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownObject(id) => write!(f, "no object with id {id}"),
            Self::WrongObjectKind {
                object_id,
                expected,
                found,
                method,
            } => write!(
                f,
                "{method} needs a {expected}, but object {object_id} is a {found}"
            ),
            Self::Parse(message) => write!(f, "invalid heap snapshot: {message}"),
            Self::LoaderClosed => write!(f, "loader is already closed"),
            Self::LoaderNotClosed => write!(f, "loader must be closed before building"),
            Self::UnknownBaseSnapshot(uid) => {
                write!(f, "no diff has been calculated against profile {uid}")
            }
            Self::NodeIndexOutOfRange(index) => write!(f, "node index {index} is out of range"),
            Self::InvalidSearch(message) => write!(f, "invalid search: {message}"),
            Self::ProbeFailed(message) => write!(f, "test probe failed: {message}"),
            Self::Spawn(message) => write!(f, "failed to start worker thread: {message}"),
            Self::Terminated => write!(f, "worker was terminated"),
        }
    }
}

impl Error for WorkerError {}
