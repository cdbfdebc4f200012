//! Host-function registration and the import-side ABI.
//!
//! A host function is a name pair plus a callback and its context. The
//! callback receives its arguments popped from the VM's operand stack in
//! declaration order, may reach into the calling instance's first memory,
//! and pushes its declared results. Context travels inside the closure;
//! implementations needing mutable state use interior mutability, which
//! keeps the callback object shareable across instances.

use std::fmt;
use std::sync::Arc;

use reef_types::Word;

use crate::error::RuntimeError;
use crate::memory::LinearMemory;
use crate::module::FuncType;

/// What a host callback sees for one call.
pub struct HostScope<'a> {
    /// Arguments, in declaration order (v128 occupies two words).
    pub args: &'a [Word],
    /// Result sink; push declared results in order.
    pub results: &'a mut Vec<Word>,
    /// The calling instance's first memory, when it has one.
    pub memory: Option<&'a Arc<LinearMemory>>,
}

/// The callback shape behind every host import.
pub type HostCallback =
    Arc<dyn Fn(&mut HostScope<'_>) -> Result<(), RuntimeError> + Send + Sync>;

/// A registered host function.
#[derive(Clone)]
pub struct HostFunc {
    /// Import module namespace.
    pub module: String,
    /// Import entry name.
    pub name: String,
    /// Declared signature.
    pub ty: FuncType,
    /// The callback.
    pub callback: HostCallback,
}

impl HostFunc {
    /// Wrap a closure as a host function.
    pub fn wrap<F>(module: &str, name: &str, ty: FuncType, f: F) -> Self
    where
        F: Fn(&mut HostScope<'_>) -> Result<(), RuntimeError> + Send + Sync + 'static,
    {
        Self {
            module: module.to_string(),
            name: name.to_string(),
            ty,
            callback: Arc::new(f),
        }
    }
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunc")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("ty", &self.ty)
            .finish_non_exhaustive()
    }
}

/// An import set: host functions offered to instantiation.
#[derive(Debug, Clone, Default)]
pub struct ImportSet {
    /// Offered functions, matched by (module, name).
    pub funcs: Vec<HostFunc>,
}

impl ImportSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host function.
    pub fn push(&mut self, func: HostFunc) {
        self.funcs.push(func);
    }

    /// Find an entry by name pair.
    pub fn find(&self, module: &str, name: &str) -> Option<&HostFunc> {
        self.funcs
            .iter()
            .find(|f| f.module == module && f.name == name)
    }
}
