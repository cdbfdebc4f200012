//! The embedding surface.
//!
//! [`WasmModule`] owns a store, the loaded module, and one instance; it is
//! what both the CLI and library embedders drive. Loading decodes,
//! registers types, validates, and instantiates; invocation spins up a VM
//! per call with the configured parameters.

use std::path::PathBuf;
use std::sync::Arc;

use reef_types::{ValType, Word};

use crate::decode;
use crate::error::{RuntimeError, VmError};
use crate::host::ImportSet;
use crate::instance;
use crate::interpreter::Vm;
use crate::module::{ExternKind, Module, Signature};
use crate::params::{DecodeLimits, VmParams};
use crate::state::ProgramState;
use crate::store::{ExternVal, Store};
use crate::validate;
use crate::wasi::{self, Capabilities, WasiCtx};

/// Introspection record for one import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportInfo {
    /// Import module namespace.
    pub module: String,
    /// Entry name.
    pub name: String,
    /// Kind of the imported entry.
    pub kind: ExternKind,
    /// Signature, for function imports.
    pub signature: Option<Signature>,
}

/// Introspection record for one export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    /// Export name.
    pub name: String,
    /// Kind of the exported entry.
    pub kind: ExternKind,
    /// Signature, for function exports.
    pub signature: Option<Signature>,
}

/// A loaded, instantiated module ready to invoke.
pub struct WasmModule {
    store: Store,
    module: Arc<Module>,
    instance: usize,
    params: VmParams,
    wasi: Option<Arc<WasiCtx>>,
    wasi_exit: Option<i32>,
}

impl std::fmt::Debug for WasmModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModule").finish_non_exhaustive()
    }
}

/// Everything `load_wasi` can be told about the sandbox.
#[derive(Debug, Clone, Default)]
pub struct WasiOptions {
    /// Capability bits.
    pub caps: Option<Capabilities>,
    /// Program arguments (argv[0] included).
    pub args: Vec<String>,
    /// Named environment entries.
    pub env: Vec<(String, String)>,
    /// Preopened directories.
    pub preopens: Vec<PathBuf>,
}

impl WasmModule {
    /// Decode, validate, predecode-on-demand, and instantiate a module with
    /// no imports offered.
    pub fn load(bytes: &[u8]) -> Result<Self, VmError> {
        Self::load_with(bytes, VmParams::default(), ImportSet::new(), None, &[])
    }

    /// Load with explicit execution parameters.
    pub fn load_with_params(bytes: &[u8], params: VmParams) -> Result<Self, VmError> {
        Self::load_with(bytes, params, ImportSet::new(), None, &[])
    }

    /// Load with the default WASI capability set (stdio, clock, random,
    /// proc_exit).
    pub fn load_wasi(bytes: &[u8]) -> Result<Self, VmError> {
        Self::load_wasi_with(bytes, VmParams::default(), WasiOptions::default(), &[])
    }

    /// Load with WASI plus explicit parameters, capabilities, and links.
    pub fn load_wasi_with(
        bytes: &[u8],
        params: VmParams,
        options: WasiOptions,
        links: &[(String, Vec<u8>)],
    ) -> Result<Self, VmError> {
        let caps = options.caps.unwrap_or_else(Capabilities::default_set);
        let ctx = WasiCtx::new(caps, options.args, options.env, options.preopens);
        let imports = wasi::import_set(&ctx);
        let mut loaded = Self::load_with(bytes, params, imports, Some(ctx), links)?;
        loaded.wasi_exit = None;
        Ok(loaded)
    }

    /// Load with caller-provided host imports.
    pub fn load_with_imports(bytes: &[u8], imports: ImportSet) -> Result<Self, VmError> {
        Self::load_with(bytes, VmParams::default(), imports, None, &[])
    }

    /// The general loader: optional side modules (`--link name=file`) are
    /// instantiated first and their exports registered under the given
    /// names, so the main module's imports can resolve against them.
    pub fn load_with(
        bytes: &[u8],
        params: VmParams,
        imports: ImportSet,
        wasi: Option<Arc<WasiCtx>>,
        links: &[(String, Vec<u8>)],
    ) -> Result<Self, VmError> {
        let mut store = Store::new();

        for (name, link_bytes) in links {
            let mut linked = decode::decode(link_bytes, &DecodeLimits::default())?;
            store.registry.register_module_types(&mut linked)?;
            validate::validate(&linked, &store.registry)?;
            linked.name = Some(name.clone());
            instance::instantiate(&mut store, Arc::new(linked), &imports, &params)
                .map_err(|e| e.error)?;
        }

        let mut module = decode::decode(bytes, &DecodeLimits::default())?;
        store.registry.register_module_types(&mut module)?;
        validate::validate(&module, &store.registry)?;
        let module = Arc::new(module);
        let instance =
            instance::instantiate(&mut store, Arc::clone(&module), &imports, &params)
                .map_err(|e| e.error)?;

        Ok(Self {
            store,
            module,
            instance,
            params,
            wasi,
            wasi_exit: None,
        })
    }

    /// The loaded module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Execution parameters.
    pub fn params(&self) -> &VmParams {
        &self.params
    }

    /// Invoke an exported function. Arguments and results travel as 64-bit
    /// words; a v128 value occupies two words. A WASI exit reads as an
    /// empty return; [`WasmModule::get_wasi_exit_code`] reports the code.
    pub fn invoke(&mut self, name: &str, args: &[Word]) -> Result<Vec<Word>, VmError> {
        Ok(self.invoke_state(name, args)?.into_values())
    }

    /// Invoke an exported function, distinguishing a normal return from a
    /// WASI exit.
    pub fn invoke_state(
        &mut self,
        name: &str,
        args: &[Word],
    ) -> Result<ProgramState, VmError> {
        let addr = match self.store.instances[self.instance].exports.get(name) {
            Some(ExternVal::Func(addr)) => *addr,
            _ => return Err(VmError::ExportNotFound(name.to_string())),
        };

        let signature = self
            .export_signature(addr)
            .ok_or(VmError::ExportNotFound(name.to_string()))?;
        let expected_words: usize = signature
            .params
            .iter()
            .map(|t| if t.is_wide() { 2 } else { 1 })
            .sum();
        if expected_words != args.len() {
            return Err(VmError::LinkError("argument count mismatch"));
        }
        // Re-pack wide values into cells.
        let mut cells = Vec::with_capacity(signature.params.len());
        let mut cursor = 0usize;
        for ty in &signature.params {
            if ty.is_wide() {
                let lo = args[cursor] as u128;
                let hi = args[cursor + 1] as u128;
                cells.push(lo | (hi << 64));
                cursor += 2;
            } else {
                cells.push(args[cursor] as u128);
                cursor += 1;
            }
        }

        let mut vm = Vm::new(&mut self.store, self.params.clone());
        let outcome = vm.call_function(addr, cells);
        match outcome {
            Ok(results) => {
                let mut words = Vec::with_capacity(results.len());
                for (cell, ty) in results.iter().zip(&signature.results) {
                    words.push(*cell as u64);
                    if ty.is_wide() {
                        words.push((*cell >> 64) as u64);
                    }
                }
                Ok(ProgramState::Completed(words))
            }
            Err(RuntimeError::Trap(reason)) => Err(VmError::Trap(reason)),
            Err(RuntimeError::Thrown(_)) => Err(VmError::Uncaught),
            Err(RuntimeError::Exit(code)) => {
                self.wasi_exit = Some(code);
                Ok(ProgramState::Exited(code))
            }
        }
    }

    /// Bounds-checked linear-memory read for the embedder.
    pub fn memory_read(&self, offset: u64, len: usize) -> Result<Vec<u8>, VmError> {
        let mem = self.first_memory()?;
        let mut out = vec![0u8; len];
        self.store.memories[mem]
            .memory
            .read_into(offset, &mut out)
            .map_err(VmError::Trap)?;
        Ok(out)
    }

    /// Bounds-checked linear-memory write for the embedder.
    pub fn memory_write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), VmError> {
        let mem = self.first_memory()?;
        self.store.memories[mem]
            .memory
            .write_from(offset, bytes)
            .map_err(VmError::Trap)
    }

    fn first_memory(&self) -> Result<usize, VmError> {
        self.store.instances[self.instance]
            .memories
            .first()
            .copied()
            .ok_or(VmError::ExportNotFound("memory".to_string()))
    }

    /// Kind and signature of an export by name.
    pub fn get_export_info(&self, name: &str) -> Option<ExportInfo> {
        let value = self.store.instances[self.instance].exports.get(name)?;
        Some(self.describe_export(name, *value))
    }

    /// All exports, for the CLI's inspect output.
    pub fn exports(&self) -> Vec<ExportInfo> {
        self.module
            .exports
            .iter()
            .filter_map(|e| self.get_export_info(&e.name))
            .collect()
    }

    fn describe_export(&self, name: &str, value: ExternVal) -> ExportInfo {
        let (kind, signature) = match value {
            ExternVal::Func(addr) => (ExternKind::Func, self.export_signature(addr)),
            ExternVal::Table(_) => (ExternKind::Table, None),
            ExternVal::Memory(_) => (ExternKind::Memory, None),
            ExternVal::Global(_) => (ExternKind::Global, None),
            ExternVal::Tag(_) => (ExternKind::Tag, None),
        };
        ExportInfo { name: name.to_string(), kind, signature }
    }

    fn export_signature(&self, addr: usize) -> Option<Signature> {
        let id = self.store.func(addr).type_id;
        self.store.registry.func_type(id).map(Signature::from)
    }

    /// The exit code passed to WASI `proc_exit`, when the program exited.
    pub fn get_wasi_exit_code(&self) -> Option<i32> {
        self.wasi_exit
            .or_else(|| self.wasi.as_ref().and_then(|ctx| ctx.exit_code()))
    }

    /// Remaining fuel is not retained between invocations; each invoke
    /// starts from the configured budget.
    pub fn set_fuel(&mut self, fuel: Option<u64>) {
        self.params.fuel = fuel;
    }
}

/// Decode just far enough to list a binary's imports, without instantiating.
pub fn inspect_imports(bytes: &[u8]) -> Result<Vec<ImportInfo>, VmError> {
    let module = decode::decode(bytes, &DecodeLimits::default())?;
    let mut out = Vec::with_capacity(module.imports.len());
    for import in &module.imports {
        let (kind, signature) = match &import.desc {
            crate::module::ImportDesc::Func(ty) => {
                (ExternKind::Func, module.func_type(*ty).map(Signature::from))
            }
            crate::module::ImportDesc::Table(_) => (ExternKind::Table, None),
            crate::module::ImportDesc::Memory(_) => (ExternKind::Memory, None),
            crate::module::ImportDesc::Global(_) => (ExternKind::Global, None),
            crate::module::ImportDesc::Tag(ty) => {
                (ExternKind::Tag, module.func_type(*ty).map(Signature::from))
            }
        };
        out.push(ImportInfo {
            module: import.module.clone(),
            name: import.name.clone(),
            kind,
            signature,
        });
    }
    Ok(out)
}

/// Decode and validate without instantiating; the CLI's `validate` command.
pub fn validate_bytes(bytes: &[u8]) -> Result<(), VmError> {
    let mut store = Store::new();
    let mut module = decode::decode(bytes, &DecodeLimits::default())?;
    store.registry.register_module_types(&mut module)?;
    validate::validate(&module, &store.registry)
}

/// Signature-directed argument parsing for `--invoke`: signed decimal for
/// integers, decimal for floats.
pub fn parse_invoke_args(
    signature: &Signature,
    raw: &[String],
) -> Result<Vec<Word>, VmError> {
    let mut words = Vec::new();
    if raw.len() != signature.params.len() {
        return Err(VmError::LinkError("argument count mismatch"));
    }
    for (text, ty) in raw.iter().zip(&signature.params) {
        match ty {
            ValType::I32 => {
                let v: i64 = text
                    .parse()
                    .map_err(|_| VmError::LinkError("invalid integer argument"))?;
                words.push(v as i32 as u32 as u64);
            }
            ValType::I64 => {
                let v: i64 = text
                    .parse()
                    .map_err(|_| VmError::LinkError("invalid integer argument"))?;
                words.push(v as u64);
            }
            ValType::F32 => {
                let v: f32 = text
                    .parse()
                    .map_err(|_| VmError::LinkError("invalid float argument"))?;
                words.push(u64::from(v.to_bits()));
            }
            ValType::F64 => {
                let v: f64 = text
                    .parse()
                    .map_err(|_| VmError::LinkError("invalid float argument"))?;
                words.push(v.to_bits());
            }
            _ => return Err(VmError::LinkError("reference argument not expressible")),
        }
    }
    Ok(words)
}

/// Result formatting for `--invoke`: signed decimal integers, decimal
/// floats (never raw bits).
pub fn format_invoke_results(signature: &Signature, words: &[Word]) -> Vec<String> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    for ty in &signature.results {
        if cursor >= words.len() {
            break;
        }
        let word = words[cursor];
        out.push(match ty {
            ValType::I32 => (word as u32 as i32).to_string(),
            ValType::I64 => (word as i64).to_string(),
            ValType::F32 => f32::from_bits(word as u32).to_string(),
            ValType::F64 => f64::from_bits(word).to_string(),
            ValType::V128 => {
                let hi = words.get(cursor + 1).copied().unwrap_or_default();
                cursor += 1;
                format!("0x{hi:016x}{word:016x}")
            }
            ValType::Ref(_) => format!("ref:{word:#x}"),
        });
        cursor += 1;
    }
    out
}
