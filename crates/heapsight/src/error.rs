use std::error::Error;
use std::fmt;

use heapsight_types::ObjectId;
use heapsight_wire::WireError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The worker failed the call. The details were logged, not forwarded.
    CallAbandoned { method: String },
    /// The worker failed the call and the client is configured to forward
    /// the failure.
    Remote {
        message: String,
        method: Option<String>,
        call_stack: Option<String>,
    },
    WorkerTerminated,
    Transport(String),
    Codec(String),
    UnexpectedResult {
        method: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallAbandoned { method } => write!(f, "worker call {method} failed"),
            Self::Remote {
                message, method, ..
            } => match method {
                Some(method) => write!(f, "worker call {method} failed: {message}"),
                None => write!(f, "worker call failed: {message}"),
            },
            Self::WorkerTerminated => write!(f, "worker was terminated"),
            Self::Transport(message) => write!(f, "worker transport: {message}"),
            Self::Codec(message) => write!(f, "worker codec: {message}"),
            Self::UnexpectedResult {
                method,
                expected,
                found,
            } => write!(f, "{method} answered with {found}, expected {expected}"),
        }
    }
}

impl Error for RpcError {}

impl From<WireError> for RpcError {
    fn from(error: WireError) -> Self {
        Self::Codec(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    FileRead { path: String, message: String },
    BrokenSnapshot(String),
    Rpc(RpcError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileRead { path, message } => write!(f, "failed to read {path}: {message}"),
            Self::BrokenSnapshot(message) => write!(f, "snapshot is broken: {message}"),
            Self::Rpc(error) => write!(f, "{error}"),
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Rpc(error) => Some(error),
            _ => None,
        }
    }
}

impl From<RpcError> for LoadError {
    fn from(error: RpcError) -> Self {
        Self::Rpc(error)
    }
}

/// Failures of the view grids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    UnknownColumn { grid: &'static str, column: String },
    NoDataSource,
    UnknownObject(ObjectId),
    Rpc(RpcError),
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownColumn { grid, column } => write!(f, "{grid} grid has no column {column}"),
            Self::NoDataSource => write!(f, "data sources have not been set"),
            Self::UnknownObject(id) => write!(f, "no proxy for object {id}"),
            Self::Rpc(error) => write!(f, "{error}"),
        }
    }
}

impl Error for GridError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Rpc(error) => Some(error),
            _ => None,
        }
    }
}

impl From<RpcError> for GridError {
    fn from(error: RpcError) -> Self {
        Self::Rpc(error)
    }
}
