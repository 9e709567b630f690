//! The debugger side of a plugin channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::plugin::LanguagePlugin;
use crate::types::{
    ExpressionOrField, FieldPath, Formatter, FunctionFrames, RawLocation, RawLocationRange, RawModule,
    ScopeInfo, SourceLocation, SupportedScriptTypes, TypeInfos, Variable,
};
use crate::wire::{PluginCall, PluginEvent, PluginMessage, PluginRequest, decode, encode};
use crate::{BridgeError, PluginError};

type Resolver = oneshot::Sender<Result<Value, BridgeError>>;

struct Shared {
    to_plugin: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<u64, Resolver>>,
}

impl Shared {
    /// Rejects everything pending and refuses new requests.
    fn disconnect(&self) {
        self.to_plugin.lock().take();
        let pending: Vec<Resolver> = self.pending.lock().drain().map(|(_, resolve)| resolve).collect();
        if !pending.is_empty() {
            debug!(rejected = pending.len(), "rejecting requests of a disconnected plugin");
        }
        for resolve in pending {
            let _ = resolve.send(Err(BridgeError::Disconnected));
        }
    }

    fn on_message(&self, message: PluginMessage) -> bool {
        let (request_id, outcome) = match message {
            PluginMessage::Event {
                event: PluginEvent::UnregisteredLanguageExtensionPlugin,
            } => {
                self.disconnect();
                return false;
            }
            PluginMessage::Reply { request_id, result } => (request_id, Ok(result)),
            PluginMessage::Failure { request_id, error } => {
                (request_id, Err(BridgeError::Remote(error.message)))
            }
        };
        match self.pending.lock().remove(&request_id) {
            Some(resolve) => {
                let _ = resolve.send(outcome);
            }
            None => error!(request_id, "no pending request"),
        }
        true
    }
}

/// A registered plugin as the debugger sees it. Every call is a request on
/// the plugin's channel; replies are matched back by request id.
pub struct PluginEndpoint {
    name: String,
    supported: SupportedScriptTypes,
    next_request_id: AtomicU64,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl PluginEndpoint {
    pub(crate) fn new(
        name: &str,
        supported: SupportedScriptTypes,
        to_plugin: mpsc::UnboundedSender<String>,
        mut replies: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let shared = Arc::new(Shared {
            to_plugin: Mutex::new(Some(to_plugin)),
            pending: Mutex::new(HashMap::new()),
        });
        let reader_shared = shared.clone();
        let plugin = name.to_string();
        let reader = tokio::spawn(async move {
            while let Some(frame) = replies.recv().await {
                match decode::<PluginMessage>(&frame) {
                    Ok(message) => {
                        if !reader_shared.on_message(message) {
                            info!(plugin = %plugin, "language plugin went away");
                            return;
                        }
                    }
                    Err(e) => warn!(plugin = %plugin, error = %e, "dropping undecodable plugin frame"),
                }
            }
            reader_shared.disconnect();
        });
        Self {
            name: name.to_string(),
            supported,
            next_request_id: AtomicU64::new(0),
            shared,
            reader,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supported_script_types(&self) -> &SupportedScriptTypes {
        &self.supported
    }

    pub fn is_connected(&self) -> bool {
        self.shared.to_plugin.lock().is_some()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Whether this plugin symbolizes scripts in `language` carrying debug
    /// symbols of `symbol_type`.
    pub fn handles_script(&self, language: Option<&str>, symbol_type: Option<&str>) -> bool {
        self.supported.matches(language, symbol_type)
    }

    /// Sends `call` and waits for its reply.
    pub async fn send_request<T: DeserializeOwned>(&self, call: PluginCall) -> Result<T, BridgeError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode(&PluginRequest::new(request_id, &call)?)?;
        let (resolve, reply) = oneshot::channel();
        {
            let to_plugin = self.shared.to_plugin.lock();
            let Some(to_plugin) = to_plugin.as_ref() else {
                return Err(BridgeError::Disconnected);
            };
            self.shared.pending.lock().insert(request_id, resolve);
            if to_plugin.send(frame).is_err() {
                self.shared.pending.lock().remove(&request_id);
                return Err(BridgeError::Disconnected);
            }
        }
        let result = reply.await.map_err(|_| BridgeError::Disconnected)??;
        serde_json::from_value(result).map_err(|e| BridgeError::Codec(format!("{}: {e}", call.method())))
    }
}

impl Drop for PluginEndpoint {
    fn drop(&mut self) {
        self.reader.abort();
        self.shared.disconnect();
    }
}

#[async_trait]
impl LanguagePlugin for PluginEndpoint {
    async fn add_raw_module(
        &self,
        raw_module_id: &str,
        symbols_url: &str,
        raw_module: &RawModule,
    ) -> Result<Vec<String>, PluginError> {
        Ok(self
            .send_request(PluginCall::AddRawModule {
                raw_module_id: raw_module_id.to_string(),
                symbols_url: symbols_url.to_string(),
                raw_module: raw_module.clone(),
            })
            .await?)
    }

    async fn remove_raw_module(&self, raw_module_id: &str) -> Result<(), PluginError> {
        let _: Value = self
            .send_request(PluginCall::RemoveRawModule {
                raw_module_id: raw_module_id.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn source_location_to_raw_location(
        &self,
        source_location: &SourceLocation,
    ) -> Result<Vec<RawLocationRange>, PluginError> {
        Ok(self
            .send_request(PluginCall::SourceLocationToRawLocation {
                source_location: source_location.clone(),
            })
            .await?)
    }

    async fn raw_location_to_source_location(
        &self,
        raw_location: &RawLocation,
    ) -> Result<Vec<SourceLocation>, PluginError> {
        Ok(self
            .send_request(PluginCall::RawLocationToSourceLocation {
                raw_location: raw_location.clone(),
            })
            .await?)
    }

    async fn get_scope_info(&self, scope_type: &str) -> Result<ScopeInfo, PluginError> {
        Ok(self
            .send_request(PluginCall::GetScopeInfo {
                scope_type: scope_type.to_string(),
            })
            .await?)
    }

    async fn list_variables_in_scope(&self, raw_location: &RawLocation) -> Result<Vec<Variable>, PluginError> {
        Ok(self
            .send_request(PluginCall::ListVariablesInScope {
                raw_location: raw_location.clone(),
            })
            .await?)
    }

    async fn get_type_info(
        &self,
        expression: &str,
        context: &RawLocation,
    ) -> Result<Option<TypeInfos>, PluginError> {
        Ok(self
            .send_request(PluginCall::GetTypeInfo {
                expression: expression.to_string(),
                context: context.clone(),
            })
            .await?)
    }

    async fn get_formatter(
        &self,
        expression_or_field: &ExpressionOrField,
        context: &RawLocation,
    ) -> Result<Formatter, PluginError> {
        Ok(self
            .send_request(PluginCall::GetFormatter {
                expression_or_field: expression_or_field.clone(),
                context: context.clone(),
            })
            .await?)
    }

    async fn get_inspectable_address(&self, field: &FieldPath) -> Result<Formatter, PluginError> {
        Ok(self
            .send_request(PluginCall::GetInspectableAddress { field: field.clone() })
            .await?)
    }

    async fn get_function_info(&self, raw_location: &RawLocation) -> Result<FunctionFrames, PluginError> {
        Ok(self
            .send_request(PluginCall::GetFunctionInfo {
                raw_location: raw_location.clone(),
            })
            .await?)
    }

    async fn get_inlined_function_ranges(
        &self,
        raw_location: &RawLocation,
    ) -> Result<Vec<RawLocationRange>, PluginError> {
        Ok(self
            .send_request(PluginCall::GetInlinedFunctionRanges {
                raw_location: raw_location.clone(),
            })
            .await?)
    }

    async fn get_inlined_callees_ranges(
        &self,
        raw_location: &RawLocation,
    ) -> Result<Vec<RawLocationRange>, PluginError> {
        Ok(self
            .send_request(PluginCall::GetInlinedCalleesRanges {
                raw_location: raw_location.clone(),
            })
            .await?)
    }

    async fn get_mapped_lines(
        &self,
        raw_module_id: &str,
        source_file_url: &str,
    ) -> Result<Option<Vec<u32>>, PluginError> {
        Ok(self
            .send_request(PluginCall::GetMappedLines {
                raw_module_id: raw_module_id.to_string(),
                source_file_url: source_file_url.to_string(),
            })
            .await?)
    }
}
