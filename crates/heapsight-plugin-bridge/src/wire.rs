//! Frames on a plugin channel.
//!
//! The debugger sends `{requestId, method, parameters}`. The plugin side
//! answers `{requestId, result}` or `{requestId, error: {message}}`, and
//! announces its own removal with `{event: "unregisteredLanguageExtensionPlugin"}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::BridgeError;
use crate::types::{ExpressionOrField, FieldPath, RawLocation, RawModule, SourceLocation};

/// Every method a plugin answers, by wire name.
pub const METHODS: [&str; 13] = [
    "addRawModule",
    "removeRawModule",
    "sourceLocationToRawLocation",
    "rawLocationToSourceLocation",
    "getScopeInfo",
    "listVariablesInScope",
    "getTypeInfo",
    "getFormatter",
    "getInspectableAddress",
    "getFunctionInfo",
    "getInlinedFunctionRanges",
    "getInlinedCalleesRanges",
    "getMappedLines",
];

/// A method call with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "parameters",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum PluginCall {
    AddRawModule {
        raw_module_id: String,
        #[serde(rename = "symbolsURL")]
        symbols_url: String,
        raw_module: RawModule,
    },
    RemoveRawModule {
        raw_module_id: String,
    },
    SourceLocationToRawLocation {
        source_location: SourceLocation,
    },
    RawLocationToSourceLocation {
        raw_location: RawLocation,
    },
    GetScopeInfo {
        #[serde(rename = "type")]
        scope_type: String,
    },
    ListVariablesInScope {
        raw_location: RawLocation,
    },
    GetTypeInfo {
        expression: String,
        context: RawLocation,
    },
    GetFormatter {
        expression_or_field: ExpressionOrField,
        context: RawLocation,
    },
    GetInspectableAddress {
        field: FieldPath,
    },
    GetFunctionInfo {
        raw_location: RawLocation,
    },
    GetInlinedFunctionRanges {
        raw_location: RawLocation,
    },
    GetInlinedCalleesRanges {
        raw_location: RawLocation,
    },
    GetMappedLines {
        raw_module_id: String,
        #[serde(rename = "sourceFileURL")]
        source_file_url: String,
    },
}

impl PluginCall {
    pub fn method(&self) -> &'static str {
        match self {
            Self::AddRawModule { .. } => METHODS[0],
            Self::RemoveRawModule { .. } => METHODS[1],
            Self::SourceLocationToRawLocation { .. } => METHODS[2],
            Self::RawLocationToSourceLocation { .. } => METHODS[3],
            Self::GetScopeInfo { .. } => METHODS[4],
            Self::ListVariablesInScope { .. } => METHODS[5],
            Self::GetTypeInfo { .. } => METHODS[6],
            Self::GetFormatter { .. } => METHODS[7],
            Self::GetInspectableAddress { .. } => METHODS[8],
            Self::GetFunctionInfo { .. } => METHODS[9],
            Self::GetInlinedFunctionRanges { .. } => METHODS[10],
            Self::GetInlinedCalleesRanges { .. } => METHODS[11],
            Self::GetMappedLines { .. } => METHODS[12],
        }
    }
}

/// Request frame. `method` and `parameters` stay raw until the plugin side
/// decodes them, so that a call it does not understand still gets an
/// error reply carrying its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRequest {
    pub request_id: u64,
    pub method: String,
    #[serde(default)]
    pub parameters: Value,
}

impl PluginRequest {
    pub fn new(request_id: u64, call: &PluginCall) -> Result<Self, BridgeError> {
        let encoded = serde_json::to_value(call).map_err(|e| BridgeError::Codec(e.to_string()))?;
        let Value::Object(mut fields) = encoded else {
            return Err(BridgeError::Codec(format!("{} did not encode as an object", call.method())));
        };
        Ok(Self {
            request_id,
            method: call.method().to_string(),
            parameters: fields.remove("parameters").unwrap_or(Value::Null),
        })
    }

    /// Decodes the call. The error is the message sent back to the caller.
    pub fn call(&self) -> Result<PluginCall, String> {
        if !METHODS.contains(&self.method.as_str()) {
            return Err(format!("Unknown language plugin method {}", self.method));
        }
        let tagged = serde_json::json!({
            "method": self.method,
            "parameters": self.parameters,
        });
        serde_json::from_value(tagged).map_err(|e| format!("Invalid parameters for {}: {e}", self.method))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginEvent {
    UnregisteredLanguageExtensionPlugin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
}

/// Frame from the plugin side back to the debugger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginMessage {
    Event {
        event: PluginEvent,
    },
    Failure {
        #[serde(rename = "requestId")]
        request_id: u64,
        error: RemoteError,
    },
    Reply {
        #[serde(rename = "requestId")]
        request_id: u64,
        #[serde(default)]
        result: Value,
    },
}

pub fn encode<T: Serialize>(frame: &T) -> Result<String, BridgeError> {
    serde_json::to_string(frame).map_err(|e| BridgeError::Codec(e.to_string()))
}

pub fn decode<T: for<'de> Deserialize<'de>>(frame: &str) -> Result<T, BridgeError> {
    serde_json::from_str(frame).map_err(|e| BridgeError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> RawLocation {
        RawLocation {
            raw_module_id: "m1".to_string(),
            code_offset: 42,
            inline_frame_index: 0,
        }
    }

    #[test]
    fn requests_keep_the_camel_case_wire_names() {
        let call = PluginCall::AddRawModule {
            raw_module_id: "m1".to_string(),
            symbols_url: "file:///app.wasm.debug".to_string(),
            raw_module: RawModule {
                url: "file:///app.wasm".to_string(),
                code: None,
            },
        };
        let request = PluginRequest::new(7, &call).expect("request");
        assert_eq!(request.method, "addRawModule");
        assert_eq!(
            request.parameters,
            serde_json::json!({
                "rawModuleId": "m1",
                "symbolsURL": "file:///app.wasm.debug",
                "rawModule": { "url": "file:///app.wasm" },
            })
        );

        let frame = encode(&request).expect("encode");
        let request: PluginRequest = decode(&frame).expect("decode");
        assert_eq!(request.request_id, 7);
        assert_eq!(request.call(), Ok(call));
    }

    #[test]
    fn every_method_name_round_trips_through_its_call() {
        let calls = [
            PluginCall::RemoveRawModule {
                raw_module_id: "m1".to_string(),
            },
            PluginCall::GetScopeInfo {
                scope_type: "local".to_string(),
            },
            PluginCall::ListVariablesInScope {
                raw_location: location(),
            },
            PluginCall::GetMappedLines {
                raw_module_id: "m1".to_string(),
                source_file_url: "main.c".to_string(),
            },
        ];
        for call in calls {
            let request = PluginRequest::new(1, &call).expect("request");
            assert_eq!(request.method, call.method());
            assert_eq!(request.call().as_ref(), Ok(&call));
        }
    }

    #[test]
    fn scope_type_is_sent_as_type() {
        let call = PluginCall::GetScopeInfo {
            scope_type: "global".to_string(),
        };
        let frame = encode(&PluginRequest::new(0, &call).expect("request")).expect("encode");
        insta::assert_snapshot!(frame, @r#"{"requestId":0,"method":"getScopeInfo","parameters":{"type":"global"}}"#);
    }

    #[test]
    fn unknown_methods_and_bad_parameters_are_reported() {
        let unknown = PluginRequest {
            request_id: 3,
            method: "evaluate".to_string(),
            parameters: Value::Null,
        };
        assert_eq!(unknown.call(), Err("Unknown language plugin method evaluate".to_string()));

        let malformed = PluginRequest {
            request_id: 4,
            method: "getScopeInfo".to_string(),
            parameters: serde_json::json!({ "kind": "local" }),
        };
        let message = malformed.call().unwrap_err();
        assert!(message.starts_with("Invalid parameters for getScopeInfo"), "{message}");
    }

    #[test]
    fn plugin_messages_are_told_apart_by_their_fields() {
        let reply: PluginMessage = decode(r#"{"requestId":1,"result":["a.c"]}"#).expect("reply");
        assert_eq!(
            reply,
            PluginMessage::Reply {
                request_id: 1,
                result: serde_json::json!(["a.c"]),
            }
        );

        let void: PluginMessage = decode(r#"{"requestId":2}"#).expect("void reply");
        assert_eq!(
            void,
            PluginMessage::Reply {
                request_id: 2,
                result: Value::Null,
            }
        );

        let failure: PluginMessage = decode(r#"{"requestId":3,"error":{"message":"no symbols"}}"#).expect("failure");
        assert!(matches!(failure, PluginMessage::Failure { request_id: 3, error } if error.message == "no symbols"));

        let event = encode(&PluginMessage::Event {
            event: PluginEvent::UnregisteredLanguageExtensionPlugin,
        })
        .expect("encode");
        insta::assert_snapshot!(event, @r#"{"event":"unregisteredLanguageExtensionPlugin"}"#);
    }
}
