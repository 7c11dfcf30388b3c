//! Module metadata carried in a wasm custom section.
//!
//! The compiler embeds a JSON document describing the structs the module
//! lays out in memory and the graphl-level signatures of its exports:
//!
//! ```json
//! {
//!   "version": 1,
//!   "structs": [{ "name": "vec3", "size": 24, "fields": [
//!       { "name": "x", "type": "f64", "offset": 0 }, ... ] }],
//!   "functions": { "length": { "params": ["vec3"], "results": ["f64"] } }
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use graphl_types::{
    RegistryError, StagedStructs, StructDecl, TypeDescriptor, TypeRegistry, ValueKind,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wasmparser::{Parser, Payload};

use crate::abi::{FunctionSignature, METADATA_VERSION};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata section `{section}` is not valid JSON: {source}")]
    Json {
        section: String,
        source: serde_json::Error,
    },

    #[error("metadata version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("metadata section `{0}` appears more than once")]
    Repeated(String),
}

/// Graphl-level types of one export, by type name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredSignature {
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub results: Vec<String>,
}

impl DeclaredSignature {
    pub fn new<S: Into<String>>(
        params: impl IntoIterator<Item = S>,
        results: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            results: results.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolve type names to boundary kinds.
    ///
    /// `void` results are dropped; a `void` parameter is an error.
    pub fn resolve(&self, registry: &TypeRegistry) -> Result<FunctionSignature, RegistryError> {
        self.resolve_with(|name| registry.lookup(name))
    }

    /// [`resolve`](Self::resolve) against module structs that are staged
    /// but not yet registered.
    pub fn resolve_staged(
        &self,
        registry: &TypeRegistry,
        staged: &StagedStructs,
    ) -> Result<FunctionSignature, RegistryError> {
        self.resolve_with(|name| staged.lookup(registry, name))
    }

    fn resolve_with(
        &self,
        lookup: impl Fn(&str) -> Result<Arc<TypeDescriptor>, RegistryError>,
    ) -> Result<FunctionSignature, RegistryError> {
        let mut params = Vec::with_capacity(self.params.len());
        for name in &self.params {
            match lookup(name)?.boundary_kind() {
                Some(kind) => params.push(kind),
                None => {
                    return Err(RegistryError::InvalidLayout {
                        name: name.clone(),
                        reason: "has no value and cannot be a parameter".into(),
                    })
                }
            }
        }
        let mut results: Vec<ValueKind> = Vec::with_capacity(self.results.len());
        for name in &self.results {
            if let Some(kind) = lookup(name)?.boundary_kind() {
                results.push(kind);
            }
        }
        Ok(FunctionSignature { params, results })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub structs: Vec<StructDecl>,
    #[serde(default)]
    pub functions: BTreeMap<String, DeclaredSignature>,
}

fn default_version() -> u32 {
    METADATA_VERSION
}

impl Default for ModuleMetadata {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            structs: Vec::new(),
            functions: BTreeMap::new(),
        }
    }
}

impl ModuleMetadata {
    pub fn from_json(section: &str, data: &[u8]) -> Result<Self, MetadataError> {
        let meta: Self = serde_json::from_slice(data).map_err(|source| MetadataError::Json {
            section: section.to_owned(),
            source,
        })?;
        if meta.version > METADATA_VERSION {
            return Err(MetadataError::UnsupportedVersion {
                found: meta.version,
                supported: METADATA_VERSION,
            });
        }
        Ok(meta)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Read the metadata section named `section` from a wasm binary.
    ///
    /// Returns `Ok(None)` when the section is absent. Malformed binaries are
    /// also reported as `None`; the loader rejects them with a better error.
    pub fn read_from_wasm(bytecode: &[u8], section: &str) -> Result<Option<Self>, MetadataError> {
        let mut found = None;
        for payload in Parser::new(0).parse_all(bytecode) {
            let Ok(payload) = payload else { break };
            if let Payload::CustomSection(reader) = payload {
                if reader.name() != section {
                    continue;
                }
                if found.is_some() {
                    return Err(MetadataError::Repeated(section.to_owned()));
                }
                found = Some(Self::from_json(section, reader.data())?);
            }
        }
        Ok(found)
    }

    pub fn function(&self, name: &str) -> Option<&DeclaredSignature> {
        self.functions.get(name)
    }
}
