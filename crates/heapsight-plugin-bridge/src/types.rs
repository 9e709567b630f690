//! Values exchanged with a language plugin, in their camelCase wire shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which scripts a plugin can symbolize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedScriptTypes {
    pub language: String,
    pub symbol_types: Vec<String>,
}

impl SupportedScriptTypes {
    pub fn new(language: &str, symbol_types: &[&str]) -> Self {
        Self {
            language: language.to_string(),
            symbol_types: symbol_types.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// A script is handled when both its language and its debug symbols are
    /// known and match.
    pub fn matches(&self, language: Option<&str>, symbol_type: Option<&str>) -> bool {
        match (language, symbol_type) {
            (Some(language), Some(symbol_type)) => {
                language == self.language && self.symbol_types.iter().any(|t| t == symbol_type)
            }
            _ => false,
        }
    }
}

/// A compiled script or wasm module handed to a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawModule {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Offset into a raw module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLocation {
    pub raw_module_id: String,
    pub code_offset: u64,
    #[serde(default)]
    pub inline_frame_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLocationRange {
    pub raw_module_id: String,
    pub start_offset: u64,
    pub end_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub raw_module_id: String,
    #[serde(rename = "sourceFileURL")]
    pub source_file_url: String,
    pub line_number: u32,
    pub column_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub scope: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub nested_name: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeInfo {
    #[serde(rename = "type")]
    pub scope_type: String,
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
}

/// Frames of a (possibly inlined) function at a raw location, innermost
/// first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionFrames {
    pub frames: Vec<FunctionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    #[serde(default)]
    pub name: Option<String>,
    pub offset: u64,
    pub type_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeInfo {
    pub type_names: Vec<String>,
    pub type_id: String,
    pub members: Vec<FieldInfo>,
    pub alignment: u64,
    #[serde(default)]
    pub array_size: u64,
    pub size: u64,
    pub can_expand: bool,
    pub has_value: bool,
}

/// Where evaluation of a field path starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalBase {
    pub root_type: TypeInfo,
    pub payload: Value,
}

/// A field path relative to an [`EvalBase`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldPath {
    pub base: EvalBase,
    pub field: Vec<FieldInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeInfos {
    pub type_infos: Vec<TypeInfo>,
    pub base: EvalBase,
}

/// What a formatter is asked for: a source expression, or a field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpressionOrField {
    Expression(String),
    Field(FieldPath),
}

/// JavaScript the debugger evaluates to render a value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formatter {
    pub js: String,
}
