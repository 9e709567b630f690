use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::*;
use crate::types::{
    ExpressionOrField, Formatter, FunctionFrames, FunctionInfo, RawLocation, RawLocationRange, RawModule,
    ScopeInfo, SourceLocation, TypeInfos, Variable,
};

#[derive(Default)]
struct CxxPlugin {
    modules: Mutex<Vec<String>>,
    started: Notify,
    release: Notify,
}

fn location() -> RawLocation {
    RawLocation {
        raw_module_id: "m1".to_string(),
        code_offset: 16,
        inline_frame_index: 0,
    }
}

fn cxx() -> SupportedScriptTypes {
    SupportedScriptTypes::new("WebAssembly", &["ExternalDWARF", "EmbeddedDWARF"])
}

#[async_trait]
impl LanguagePlugin for CxxPlugin {
    async fn add_raw_module(
        &self,
        raw_module_id: &str,
        _symbols_url: &str,
        _raw_module: &RawModule,
    ) -> Result<Vec<String>, PluginError> {
        self.modules.lock().push(raw_module_id.to_string());
        Ok(vec!["main.c".to_string(), "util.h".to_string()])
    }

    async fn remove_raw_module(&self, raw_module_id: &str) -> Result<(), PluginError> {
        self.modules.lock().retain(|id| id != raw_module_id);
        Ok(())
    }

    async fn source_location_to_raw_location(
        &self,
        source_location: &SourceLocation,
    ) -> Result<Vec<RawLocationRange>, PluginError> {
        Ok(vec![RawLocationRange {
            raw_module_id: source_location.raw_module_id.clone(),
            start_offset: 16,
            end_offset: 24,
        }])
    }

    async fn raw_location_to_source_location(
        &self,
        raw_location: &RawLocation,
    ) -> Result<Vec<SourceLocation>, PluginError> {
        Err(PluginError::new(format!("no symbols for {}", raw_location.raw_module_id)))
    }

    async fn get_scope_info(&self, scope_type: &str) -> Result<ScopeInfo, PluginError> {
        Ok(ScopeInfo {
            scope_type: scope_type.to_string(),
            type_name: "Local".to_string(),
            icon: None,
        })
    }

    async fn list_variables_in_scope(&self, _raw_location: &RawLocation) -> Result<Vec<Variable>, PluginError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(Vec::new())
    }

    async fn get_type_info(
        &self,
        _expression: &str,
        _context: &RawLocation,
    ) -> Result<Option<TypeInfos>, PluginError> {
        Ok(None)
    }

    async fn get_formatter(
        &self,
        expression_or_field: &ExpressionOrField,
        _context: &RawLocation,
    ) -> Result<Formatter, PluginError> {
        let js = match expression_or_field {
            ExpressionOrField::Expression(expression) => format!("format({expression})"),
            ExpressionOrField::Field(_) => "formatField()".to_string(),
        };
        Ok(Formatter { js })
    }

    async fn get_function_info(&self, _raw_location: &RawLocation) -> Result<FunctionFrames, PluginError> {
        Ok(FunctionFrames {
            frames: vec![
                FunctionInfo {
                    name: "inlined".to_string(),
                },
                FunctionInfo {
                    name: "main".to_string(),
                },
            ],
        })
    }

    async fn get_inlined_function_ranges(
        &self,
        _raw_location: &RawLocation,
    ) -> Result<Vec<RawLocationRange>, PluginError> {
        Ok(Vec::new())
    }

    async fn get_inlined_callees_ranges(
        &self,
        _raw_location: &RawLocation,
    ) -> Result<Vec<RawLocationRange>, PluginError> {
        Ok(Vec::new())
    }
}

#[tokio::test(flavor = "current_thread")]
async fn calls_cross_the_channel_and_come_back() {
    let host = PluginHost::new();
    let plugin = Arc::new(CxxPlugin::default());
    let endpoint = host.register("cxx", plugin.clone(), cxx()).expect("registered");
    assert_eq!(endpoint.name(), "cxx");

    let module = RawModule {
        url: "file:///app.wasm".to_string(),
        code: None,
    };
    let sources = endpoint
        .add_raw_module("m1", "file:///app.wasm.debug", &module)
        .await
        .expect("add module");
    assert_eq!(sources, ["main.c", "util.h"]);
    assert_eq!(*plugin.modules.lock(), ["m1"]);

    let scope = endpoint.get_scope_info("local").await.expect("scope info");
    assert_eq!(scope.scope_type, "local");

    let frames = endpoint.get_function_info(&location()).await.expect("function info");
    let names: Vec<&str> = frames.frames.iter().map(|frame| frame.name.as_str()).collect();
    assert_eq!(names, ["inlined", "main"]);

    let formatter = endpoint
        .get_formatter(&ExpressionOrField::Expression("x".to_string()), &location())
        .await
        .expect("formatter");
    assert_eq!(formatter.js, "format(x)");

    assert_eq!(endpoint.get_type_info("x", &location()).await.expect("type info"), None);
    // Left to the defaults by the plugin.
    assert_eq!(endpoint.get_mapped_lines("m1", "main.c").await.expect("mapped lines"), None);

    endpoint.remove_raw_module("m1").await.expect("remove module");
    assert!(plugin.modules.lock().is_empty());
    assert_eq!(endpoint.pending_requests(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn plugin_failures_reject_with_their_message() {
    let host = PluginHost::new();
    let endpoint = host
        .register("cxx", Arc::new(CxxPlugin::default()), cxx())
        .expect("registered");

    let err = endpoint
        .raw_location_to_source_location(&location())
        .await
        .unwrap_err();
    assert_eq!(err.message, "no symbols for m1");

    let err = endpoint
        .send_request::<Vec<SourceLocation>>(PluginCall::RawLocationToSourceLocation {
            raw_location: location(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::Remote("no symbols for m1".to_string()));
    assert!(endpoint.is_connected());
}

#[tokio::test(flavor = "current_thread")]
async fn names_are_registered_once() {
    let host = PluginHost::new();
    let _endpoint = host
        .register("cxx", Arc::new(CxxPlugin::default()), cxx())
        .expect("registered");
    let duplicate = host.register("cxx", Arc::new(CxxPlugin::default()), cxx());
    assert!(matches!(duplicate, Err(BridgeError::Duplicate(name)) if name == "cxx"));

    assert_eq!(host.unregister("rust"), Err(BridgeError::NotRegistered("rust".to_string())));
    host.unregister("cxx").expect("unregistered");
    assert!(!host.is_registered("cxx"));
    assert!(host.register("cxx", Arc::new(CxxPlugin::default()), cxx()).is_ok());
}

#[tokio::test(flavor = "current_thread")]
async fn unregistering_rejects_pending_requests() {
    let host = PluginHost::new();
    let plugin = Arc::new(CxxPlugin::default());
    let endpoint = Arc::new(host.register("cxx", plugin.clone(), cxx()).expect("registered"));

    let waiting = tokio::spawn({
        let endpoint = endpoint.clone();
        async move { endpoint.list_variables_in_scope(&location()).await }
    });
    plugin.started.notified().await;
    assert_eq!(endpoint.pending_requests(), 1);

    host.unregister("cxx").expect("unregistered");
    let err = waiting.await.expect("request task").unwrap_err();
    assert_eq!(err.message, "Language extension endpoint disconnected");
    assert!(!endpoint.is_connected());
    assert_eq!(endpoint.pending_requests(), 0);

    let err = endpoint.get_scope_info("local").await.unwrap_err();
    assert_eq!(err, PluginError::from(BridgeError::Disconnected));
}

#[tokio::test(flavor = "current_thread")]
async fn endpoints_serve_as_plugins_themselves() {
    let inner_host = PluginHost::new();
    let inner = inner_host
        .register("cxx", Arc::new(CxxPlugin::default()), cxx())
        .expect("registered");
    let outer_host = PluginHost::new();
    let outer = outer_host
        .register("relay", Arc::new(inner), cxx())
        .expect("registered");

    let ranges = outer
        .source_location_to_raw_location(&SourceLocation {
            raw_module_id: "m2".to_string(),
            source_file_url: "main.c".to_string(),
            line_number: 3,
            column_number: -1,
        })
        .await
        .expect("ranges");
    assert_eq!(ranges.len(), 1);
    assert_eq!((ranges[0].start_offset, ranges[0].end_offset), (16, 24));
}

#[test]
fn scripts_need_a_matching_language_and_symbol_type() {
    let supported = cxx();
    assert!(supported.matches(Some("WebAssembly"), Some("ExternalDWARF")));
    assert!(!supported.matches(Some("WebAssembly"), Some("SourceMap")));
    assert!(!supported.matches(Some("JavaScript"), Some("ExternalDWARF")));
    assert!(!supported.matches(None, Some("ExternalDWARF")));
    assert!(!supported.matches(Some("WebAssembly"), None));
}
