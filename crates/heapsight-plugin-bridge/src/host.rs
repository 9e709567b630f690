//! The plugin side: serves registered plugins over their channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::BridgeError;
use crate::endpoint::PluginEndpoint;
use crate::plugin::{LanguagePlugin, dispatch};
use crate::types::SupportedScriptTypes;
use crate::wire::{PluginEvent, PluginMessage, PluginRequest, RemoteError, decode, encode};

struct Registration {
    to_endpoint: mpsc::UnboundedSender<String>,
    serving: JoinHandle<()>,
}

/// Registered plugins by name.
#[derive(Default)]
pub struct PluginHost {
    plugins: Mutex<HashMap<String, Registration>>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.plugins.lock().contains_key(name)
    }

    /// Opens a channel for `plugin` and starts answering requests on it.
    /// Returns the debugger's end. Must be called inside a tokio runtime.
    pub fn register(
        &self,
        name: &str,
        plugin: Arc<dyn LanguagePlugin>,
        supported: SupportedScriptTypes,
    ) -> Result<PluginEndpoint, BridgeError> {
        let mut plugins = self.plugins.lock();
        if plugins.contains_key(name) {
            return Err(BridgeError::Duplicate(name.to_string()));
        }
        let (to_plugin, requests) = mpsc::unbounded_channel();
        let (to_endpoint, replies) = mpsc::unbounded_channel();
        let serving = tokio::spawn(serve(name.to_string(), plugin, requests, to_endpoint.clone()));
        plugins.insert(
            name.to_string(),
            Registration {
                to_endpoint,
                serving,
            },
        );
        info!(plugin = name, language = %supported.language, "language plugin registered");
        Ok(PluginEndpoint::new(name, supported, to_plugin, replies))
    }

    /// Tells the debugger the plugin is gone, then closes the channel.
    /// Requests still running are dropped unanswered.
    pub fn unregister(&self, name: &str) -> Result<(), BridgeError> {
        let registration = self
            .plugins
            .lock()
            .remove(name)
            .ok_or_else(|| BridgeError::NotRegistered(name.to_string()))?;
        let event = encode(&PluginMessage::Event {
            event: PluginEvent::UnregisteredLanguageExtensionPlugin,
        })?;
        if registration.to_endpoint.send(event).is_err() {
            debug!(plugin = name, "endpoint already gone");
        }
        registration.serving.abort();
        info!(plugin = name, "language plugin unregistered");
        Ok(())
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        for (_, registration) in self.plugins.lock().drain() {
            registration.serving.abort();
        }
    }
}

/// Answers requests until the debugger hangs up. Requests run
/// concurrently and reply in completion order.
async fn serve(
    name: String,
    plugin: Arc<dyn LanguagePlugin>,
    mut requests: mpsc::UnboundedReceiver<String>,
    to_endpoint: mpsc::UnboundedSender<String>,
) {
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            frame = requests.recv() => {
                let Some(frame) = frame else { break };
                let request: PluginRequest = match decode(&frame) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(plugin = %name, error = %e, "dropping undecodable plugin request");
                        continue;
                    }
                };
                running.spawn(answer(plugin.clone(), request, to_endpoint.clone()));
            }
            Some(_) = running.join_next(), if !running.is_empty() => {}
        }
    }
    while running.join_next().await.is_some() {}
    debug!(plugin = %name, "plugin channel closed");
}

async fn answer(plugin: Arc<dyn LanguagePlugin>, request: PluginRequest, to_endpoint: mpsc::UnboundedSender<String>) {
    let started = Instant::now();
    let outcome = match request.call() {
        Ok(call) => dispatch(plugin.as_ref(), call).await.map_err(|e| e.message),
        Err(message) => Err(message),
    };
    let reply = match outcome {
        Ok(result) => PluginMessage::Reply {
            request_id: request.request_id,
            result,
        },
        Err(message) => PluginMessage::Failure {
            request_id: request.request_id,
            error: RemoteError { message },
        },
    };
    debug!(
        request_id = request.request_id,
        method = %request.method,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "plugin request answered"
    );
    match encode(&reply) {
        Ok(frame) => {
            if to_endpoint.send(frame).is_err() {
                debug!(request_id = request.request_id, "endpoint gone before the reply");
            }
        }
        Err(e) => warn!(request_id = request.request_id, error = %e, "could not encode plugin reply"),
    }
}
