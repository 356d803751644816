//! The `meta.k8s.io/v1` `Table` rendering of list and get responses.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub column_definitions: Vec<TableColumnDefinition>,
    #[serde(default)]
    pub rows: Vec<TableRow>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableColumnDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    #[serde(default)]
    pub cells: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
}

/// Whether an `Accept` header asks for the `Table` rendering.
pub fn accepts_table(accept: &str) -> bool {
    accept
        .split(',')
        .any(|media| media.split(';').any(|param| param.trim() == "as=Table"))
}

// === impl Table ===

impl Table {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.column_definitions
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

// === impl TableRow ===

impl TableRow {
    /// The metadata of the row's embedded object, if one was included.
    pub fn object_meta(&self) -> Option<ObjectMeta> {
        let meta = self.object.as_ref()?.get("metadata")?;
        serde_json::from_value(meta.clone()).ok()
    }

    pub fn set_object_meta(&mut self, meta: &ObjectMeta) -> serde_json::Result<()> {
        let meta = serde_json::to_value(meta)?;
        if let Some(Value::Object(obj)) = self.object.as_mut() {
            obj.insert("metadata".to_string(), meta);
        }
        Ok(())
    }
}
