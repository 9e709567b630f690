use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::PluginError;
use crate::types::{
    ExpressionOrField, FieldPath, Formatter, FunctionFrames, RawLocation, RawLocationRange, RawModule,
    ScopeInfo, SourceLocation, TypeInfos, Variable,
};
use crate::wire::PluginCall;

/// Source-level debugging for one language, backed by the debug symbols of
/// raw modules.
#[async_trait]
pub trait LanguagePlugin: Send + Sync {
    /// Loads symbols for a module. Returns the source files it maps to.
    async fn add_raw_module(
        &self,
        raw_module_id: &str,
        symbols_url: &str,
        raw_module: &RawModule,
    ) -> Result<Vec<String>, PluginError>;

    async fn remove_raw_module(&self, raw_module_id: &str) -> Result<(), PluginError>;

    async fn source_location_to_raw_location(
        &self,
        source_location: &SourceLocation,
    ) -> Result<Vec<RawLocationRange>, PluginError>;

    async fn raw_location_to_source_location(
        &self,
        raw_location: &RawLocation,
    ) -> Result<Vec<SourceLocation>, PluginError>;

    async fn get_scope_info(&self, scope_type: &str) -> Result<ScopeInfo, PluginError>;

    async fn list_variables_in_scope(&self, raw_location: &RawLocation) -> Result<Vec<Variable>, PluginError>;

    async fn get_type_info(
        &self,
        expression: &str,
        context: &RawLocation,
    ) -> Result<Option<TypeInfos>, PluginError>;

    async fn get_formatter(
        &self,
        expression_or_field: &ExpressionOrField,
        context: &RawLocation,
    ) -> Result<Formatter, PluginError>;

    /// Plugins without address support answer with empty JavaScript.
    async fn get_inspectable_address(&self, _field: &FieldPath) -> Result<Formatter, PluginError> {
        Ok(Formatter::default())
    }

    async fn get_function_info(&self, raw_location: &RawLocation) -> Result<FunctionFrames, PluginError>;

    async fn get_inlined_function_ranges(
        &self,
        raw_location: &RawLocation,
    ) -> Result<Vec<RawLocationRange>, PluginError>;

    async fn get_inlined_callees_ranges(
        &self,
        raw_location: &RawLocation,
    ) -> Result<Vec<RawLocationRange>, PluginError>;

    /// Lines of `source_file_url` that have code, if the plugin knows.
    async fn get_mapped_lines(
        &self,
        _raw_module_id: &str,
        _source_file_url: &str,
    ) -> Result<Option<Vec<u32>>, PluginError> {
        Ok(None)
    }
}

fn to_value<T: Serialize>(result: T) -> Result<Value, PluginError> {
    serde_json::to_value(result).map_err(|e| PluginError::new(format!("unserializable result: {e}")))
}

/// Runs one decoded call against `plugin`.
pub(crate) async fn dispatch(plugin: &dyn LanguagePlugin, call: PluginCall) -> Result<Value, PluginError> {
    match call {
        PluginCall::AddRawModule {
            raw_module_id,
            symbols_url,
            raw_module,
        } => to_value(
            plugin
                .add_raw_module(&raw_module_id, &symbols_url, &raw_module)
                .await?,
        ),
        PluginCall::RemoveRawModule { raw_module_id } => {
            plugin.remove_raw_module(&raw_module_id).await?;
            Ok(Value::Null)
        }
        PluginCall::SourceLocationToRawLocation { source_location } => {
            to_value(plugin.source_location_to_raw_location(&source_location).await?)
        }
        PluginCall::RawLocationToSourceLocation { raw_location } => {
            to_value(plugin.raw_location_to_source_location(&raw_location).await?)
        }
        PluginCall::GetScopeInfo { scope_type } => to_value(plugin.get_scope_info(&scope_type).await?),
        PluginCall::ListVariablesInScope { raw_location } => {
            to_value(plugin.list_variables_in_scope(&raw_location).await?)
        }
        PluginCall::GetTypeInfo {
            expression,
            context,
        } => to_value(plugin.get_type_info(&expression, &context).await?),
        PluginCall::GetFormatter {
            expression_or_field,
            context,
        } => to_value(plugin.get_formatter(&expression_or_field, &context).await?),
        PluginCall::GetInspectableAddress { field } => {
            to_value(plugin.get_inspectable_address(&field).await?)
        }
        PluginCall::GetFunctionInfo { raw_location } => {
            to_value(plugin.get_function_info(&raw_location).await?)
        }
        PluginCall::GetInlinedFunctionRanges { raw_location } => {
            to_value(plugin.get_inlined_function_ranges(&raw_location).await?)
        }
        PluginCall::GetInlinedCalleesRanges { raw_location } => {
            to_value(plugin.get_inlined_callees_ranges(&raw_location).await?)
        }
        PluginCall::GetMappedLines {
            raw_module_id,
            source_file_url,
        } => to_value(plugin.get_mapped_lines(&raw_module_id, &source_file_url).await?),
    }
}
