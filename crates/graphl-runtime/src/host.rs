//! Host-implemented functions the guest imports.
//!
//! Bindings are passed explicitly to each instantiation, so two runtimes in
//! the same process may bind the same import name to different closures.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use graphl_types::{TypedValue, ValueKind};
use thiserror::Error;

use crate::abi::FunctionSignature;

/// Arguments captured when the guest calls a host function.
///
/// String arguments have already been copied out of guest memory, so nothing
/// here borrows from the sandbox. The context is dropped as soon as the host
/// function returns.
#[derive(Debug, Clone, PartialEq)]
pub struct HostFunctionContext {
    function: String,
    args: Vec<TypedValue>,
}

impl HostFunctionContext {
    pub fn new(function: impl Into<String>, args: Vec<TypedValue>) -> Self {
        Self {
            function: function.into(),
            args,
        }
    }

    /// Import name the guest called.
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn args(&self) -> &[TypedValue] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&TypedValue> {
        self.args.get(index)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Failure signalled by a host function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostCallError {
    /// The call fails with a trap; the runtime stays usable.
    #[error("{0}")]
    Failed(String),
    /// The runtime moves to `Failed` and rejects further calls.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HostCallError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Signature of a host function body.
pub type HostFn =
    dyn Fn(&HostFunctionContext) -> Result<TypedValue, HostCallError> + Send + Sync;

/// A host function with its declared boundary signature.
#[derive(Clone)]
pub struct HostFunction {
    params: Vec<ValueKind>,
    result: ValueKind,
    body: Arc<HostFn>,
}

impl HostFunction {
    pub fn new<F>(params: impl Into<Vec<ValueKind>>, result: ValueKind, body: F) -> Self
    where
        F: Fn(&HostFunctionContext) -> Result<TypedValue, HostCallError> + Send + Sync + 'static,
    {
        Self {
            params: params.into(),
            result,
            body: Arc::new(body),
        }
    }

    pub fn params(&self) -> &[ValueKind] {
        &self.params
    }

    pub fn result(&self) -> ValueKind {
        self.result
    }

    pub fn signature(&self) -> FunctionSignature {
        FunctionSignature::new(self.params.clone(), vec![self.result])
    }

    /// Run the body and check the returned kind against the declaration.
    pub fn call(&self, ctx: &HostFunctionContext) -> Result<TypedValue, HostCallError> {
        let value = (self.body)(ctx)?;
        if value.kind() != self.result {
            return Err(HostCallError::Failed(format!(
                "host function `{}` returned {}, declared {}",
                ctx.function(),
                value.kind(),
                self.result
            )));
        }
        Ok(value)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("params", &self.params)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// Import name → host function.
///
/// Plain bindings answer imports from the configured host module
/// ([`RuntimeConfig::host_module`](crate::RuntimeConfig::host_module)).
/// Bindings added with [`with_in`](Self::with_in) answer one explicit
/// module, such as `wasi_snapshot_preview1`, and take precedence.
#[derive(Debug, Clone, Default)]
pub struct HostBindings {
    functions: BTreeMap<String, HostFunction>,
    qualified: BTreeMap<(String, String), HostFunction>,
}

impl HostBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, function: HostFunction) -> Self {
        self.insert(name, function);
        self
    }

    /// Builder form of [`insert_in`](Self::insert_in).
    pub fn with_in(
        mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        function: HostFunction,
    ) -> Self {
        self.insert_in(module, name, function);
        self
    }

    /// Bind `name` in the host module, returning the previous binding if any.
    pub fn insert(&mut self, name: impl Into<String>, function: HostFunction) -> Option<HostFunction> {
        self.functions.insert(name.into(), function)
    }

    /// Bind `module.name`, returning the previous binding if any.
    pub fn insert_in(
        &mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        function: HostFunction,
    ) -> Option<HostFunction> {
        self.qualified.insert((module.into(), name.into()), function)
    }

    pub fn get(&self, name: &str) -> Option<&HostFunction> {
        self.functions.get(name)
    }

    pub fn get_in(&self, module: &str, name: &str) -> Option<&HostFunction> {
        self.qualified.get(&(module.to_owned(), name.to_owned()))
    }

    /// The binding answering the import `module.name` when plain bindings
    /// live in `host_module`.
    pub fn resolve(&self, module: &str, name: &str, host_module: &str) -> Option<&HostFunction> {
        self.get_in(module, name)
            .or_else(|| (module == host_module).then(|| self.get(name)).flatten())
    }

    /// Names of the plain bindings.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// `(module, name)` of the module-qualified bindings.
    pub fn qualified_names(&self) -> impl Iterator<Item = (&str, &str)> {
        self.qualified
            .keys()
            .map(|(module, name)| (module.as_str(), name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.functions.len() + self.qualified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.qualified.is_empty()
    }
}
