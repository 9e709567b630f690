//! Bridge between the debugger and language plugins.
//!
//! A plugin registered with a [`PluginHost`] gets a message channel. The
//! debugger holds the other end as a [`PluginEndpoint`], which is itself a
//! [`LanguagePlugin`]: each call becomes a `{requestId, method, parameters}`
//! frame, answered by a `{requestId, result}` or `{requestId, error}` frame.
//! Unregistering a plugin rejects whatever the debugger is still waiting on.

use std::error::Error;
use std::fmt;

mod endpoint;
mod host;
mod plugin;
pub mod types;
pub mod wire;

pub use endpoint::PluginEndpoint;
pub use host::PluginHost;
pub use plugin::LanguagePlugin;
pub use types::SupportedScriptTypes;
pub use wire::{PluginCall, PluginMessage, PluginRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The plugin was unregistered or its channel closed.
    Disconnected,
    /// The plugin answered with an error.
    Remote(String),
    /// A plugin with this name is already registered.
    Duplicate(String),
    NotRegistered(String),
    Codec(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Language extension endpoint disconnected"),
            Self::Remote(message) => write!(f, "{message}"),
            Self::Duplicate(name) => write!(f, "Tried to register plugin '{name}' twice"),
            Self::NotRegistered(name) => {
                write!(f, "Tried to unregister plugin '{name}' that was not previously registered")
            }
            Self::Codec(message) => write!(f, "plugin frame codec error: {message}"),
        }
    }
}

impl Error for BridgeError {}

/// Failure reported by a plugin. Only the message crosses the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginError {
    pub message: String,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for PluginError {}

impl From<BridgeError> for PluginError {
    fn from(error: BridgeError) -> Self {
        Self::new(error.to_string())
    }
}

#[cfg(test)]
mod tests;
