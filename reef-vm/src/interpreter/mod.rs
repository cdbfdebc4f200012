//! The VM: tier dispatch, the shared operand stack, and the promotion loop.
//!
//! A `Vm` drives exactly one thread of execution against a store. Each call
//! raises the callee through the tier pipeline on demand: predecode on first
//! entry, register lowering right after, native code once the promotion
//! counters cross their thresholds. A function that cannot be lowered or
//! compiled stays on the best tier it reached; the only observable
//! difference is throughput.

use std::sync::Arc;

use reef_asm::TrapReason;
use reef_types::{FuncAddr, Word};

use crate::error::{ExecResult, RuntimeError};
use crate::host::HostScope;
use crate::lower::{self, LowerCtx};
use crate::memory::LinearMemory;
use crate::params::VmParams;
use crate::predecode;
use crate::state::ExecuteState;
use crate::store::{DerivedTier, FuncKind, Store};

mod register;
mod stack;

mod simd;

pub(crate) use stack::eval_const_expr;

/// 128-bit operand cell helpers. Scalars live in the low word.
pub(crate) fn cell(word: Word) -> u128 {
    word as u128
}

/// The low 64 bits of a cell.
pub(crate) fn word_of(cell: u128) -> Word {
    cell as u64
}

/// One VM: the execution state of a single thread.
pub struct Vm<'a> {
    /// The store everything executes against.
    pub store: &'a mut Store,
    /// Execution parameters.
    pub params: VmParams,
    /// Shared operand stack of 128-bit slots.
    pub(crate) stack: Vec<u128>,
    /// Current call depth.
    depth: usize,
    /// Remaining fuel, when metering is on.
    fuel: Option<u64>,
}

impl<'a> Vm<'a> {
    /// Create a VM over a store.
    pub fn new(store: &'a mut Store, params: VmParams) -> Self {
        let fuel = params.fuel;
        Self {
            store,
            params,
            stack: Vec::with_capacity(1024),
            depth: 0,
            fuel,
        }
    }

    /// Remaining fuel, when metering is on.
    pub fn fuel_remaining(&self) -> Option<u64> {
        self.fuel
    }

    /// Write back the fuel cell a JIT bridge carried (`u64::MAX` = off).
    pub(crate) fn set_fuel_from_bridge(&mut self, fuel: u64) {
        if self.fuel.is_some() && fuel != u64::MAX {
            self.fuel = Some(fuel);
        }
    }

    /// Charge one sampled fuel event.
    #[inline]
    pub(crate) fn fuel_charge(&mut self) -> ExecResult<()> {
        if let Some(fuel) = &mut self.fuel {
            if *fuel == 0 {
                return Err(TrapReason::FuelExhausted.into());
            }
            *fuel -= 1;
        }
        Ok(())
    }

    /// Invoke a function by store address with flat 64-bit argument words.
    ///
    /// This is the top-level entry used by the embedding facade and by
    /// instantiation (start functions, segment evaluation helpers).
    pub fn invoke(&mut self, addr: FuncAddr, args: &[Word]) -> Result<Vec<Word>, RuntimeError> {
        let cells: Vec<u128> = args.iter().map(|&w| cell(w)).collect();
        let results = self.call_function(addr, cells)?;
        Ok(results_to_words(self.store, addr, &results))
    }

    /// Call a function: depth accounting, tier selection, promotion loop.
    pub(crate) fn call_function(
        &mut self,
        addr: FuncAddr,
        mut args: Vec<u128>,
    ) -> ExecResult<Vec<u128>> {
        if self.depth >= self.params.max_call_depth {
            return Err(TrapReason::CallStackExhausted.into());
        }
        self.depth += 1;
        let mut addr = addr;
        let result = loop {
            match self.dispatch(addr, &args) {
                Ok(ExecuteState::Returned(results)) => break Ok(results),
                Ok(ExecuteState::Tail(next, next_args)) => {
                    // The callee reuses this activation; no depth growth.
                    addr = next;
                    args = next_args;
                }
                Ok(ExecuteState::JitRestart) => {
                    self.compile(addr);
                }
                Err(e) => break Err(e),
            }
        };
        self.depth -= 1;
        result
    }

    /// One execution of `addr` on its current best tier.
    fn dispatch(&mut self, addr: FuncAddr, args: &[u128]) -> ExecResult<ExecuteState> {
        self.fuel_charge()?;
        if matches!(self.store.func(addr).kind, FuncKind::Host(_)) {
            return self.call_host(addr, args);
        }

        self.raise_tiers(addr)?;
        let func = self
            .store
            .func_mut(addr)
            .wasm_mut()
            .expect("checked wasm kind");
        func.tier.hotness = func.tier.hotness.saturating_add(1);
        let want_jit = matches!(func.tier.jit, DerivedTier::Pending)
            && func.tier.hotness > self.params.jit_call_threshold;
        if self.params.jit && want_jit {
            self.compile(addr);
        }

        let func = self.store.func(addr).wasm().expect("checked wasm kind");
        if let Some(code) = func.tier.jit.ready() {
            return crate::jit::run(self, addr, &code, args);
        }
        if let Some(reg) = func.tier.reg.ready() {
            return register::run(self, addr, &reg, args);
        }
        let pre = func
            .tier
            .predecoded
            .clone()
            .expect("predecoded in raise_tiers");
        stack::run(self, addr, &pre, args)
    }

    /// Build the missing derived artifacts below the JIT.
    fn raise_tiers(&mut self, addr: FuncAddr) -> ExecResult<()> {
        let func = self.store.func(addr).wasm().expect("wasm function");
        if func.tier.predecoded.is_some() {
            return Ok(());
        }
        let module = Arc::clone(&func.module);
        let instance = func.instance;
        let def_index = func.def_index;

        let pre = predecode::predecode(&module, &module.funcs[def_index])
            .map_err(|_| RuntimeError::Trap(TrapReason::UnknownTrapReason))?;

        let reg = {
            let cx = LowerCtx {
                module: &module,
                registry: &self.store.registry,
                instance: &self.store.instances[instance],
            };
            lower::lower(&cx, &pre)
        };

        let tier = &mut self
            .store
            .func_mut(addr)
            .wasm_mut()
            .expect("wasm function")
            .tier;
        tier.predecoded = Some(pre);
        match reg {
            Ok(reg) => {
                tracing::trace!(func = addr, regs = reg.reg_count, "register tier ready");
                tier.reg = DerivedTier::Ready(reg);
            }
            Err(abort) => {
                tracing::trace!(func = addr, reason = abort.0, "register lowering bailed");
                tier.reg = DerivedTier::Failed;
            }
        }
        Ok(())
    }

    /// Compile a function to native code, recording failure permanently.
    fn compile(&mut self, addr: FuncAddr) {
        let func = self.store.func(addr).wasm().expect("wasm function");
        if !matches!(func.tier.jit, DerivedTier::Pending) {
            return;
        }
        let Some(reg) = func.tier.reg.ready() else {
            // Nothing to compile from; pin below the JIT.
            self.store
                .func_mut(addr)
                .wasm_mut()
                .expect("wasm function")
                .tier
                .jit = DerivedTier::Failed;
            return;
        };
        let compiled = crate::jit::compile(self.store, addr, &reg);
        let tier = &mut self
            .store
            .func_mut(addr)
            .wasm_mut()
            .expect("wasm function")
            .tier;
        match compiled {
            Ok(code) => {
                tracing::debug!(func = addr, "jit compiled");
                tier.jit = DerivedTier::Ready(code);
            }
            Err(reason) => {
                tracing::debug!(func = addr, reason, "jit emission failed");
                tier.jit = DerivedTier::Failed;
            }
        }
    }

    /// Run a host function.
    fn call_host(&mut self, addr: FuncAddr, args: &[u128]) -> ExecResult<ExecuteState> {
        let FuncKind::Host(host) = &self.store.func(addr).kind else {
            unreachable!("caller checked the function kind");
        };
        let callback = Arc::clone(&host.callback);
        let param_types = host.ty.params.clone();
        let result_types = host.ty.results.clone();

        // Flatten the cells into the word ABI (v128 spans two words).
        let mut words: Vec<Word> = Vec::with_capacity(args.len());
        for (cell, ty) in args.iter().zip(&param_types) {
            words.push(word_of(*cell));
            if ty.is_wide() {
                words.push((*cell >> 64) as u64);
            }
        }

        let memory = self.current_host_memory(addr);
        let mut results: Vec<Word> = Vec::new();
        {
            let mut scope = HostScope {
                args: &words,
                results: &mut results,
                memory: memory.as_ref(),
            };
            callback(&mut scope)?;
        }

        // Re-widen into cells per the declared result types.
        let mut cells = Vec::with_capacity(result_types.len());
        let mut it = results.into_iter();
        for ty in &result_types {
            let lo = it.next().unwrap_or_default();
            let cell = if ty.is_wide() {
                (lo as u128) | ((it.next().unwrap_or_default() as u128) << 64)
            } else {
                lo as u128
            };
            cells.push(cell);
        }
        Ok(ExecuteState::Returned(cells))
    }

    /// The instance memory a host callback may touch: the first memory of
    /// the instance that owns the most recent Wasm frame. Host functions
    /// belong to no instance, so resolution is dynamic.
    fn current_host_memory(&self, _addr: FuncAddr) -> Option<Arc<LinearMemory>> {
        self.store
            .instances
            .iter()
            .rev()
            .find_map(|inst| inst.memories.first())
            .map(|&mem| Arc::clone(&self.store.memories[mem].memory))
    }
}

/// Flatten result cells into the embedder's word ABI.
fn results_to_words(store: &Store, addr: FuncAddr, results: &[u128]) -> Vec<Word> {
    let ty = store.func(addr).type_id;
    let Some(ft) = store.registry.func_type(ty) else {
        return results.iter().map(|&c| word_of(c)).collect();
    };
    let mut words = Vec::with_capacity(results.len());
    for (cell, ty) in results.iter().zip(&ft.results) {
        words.push(word_of(*cell));
        if ty.is_wide() {
            words.push((*cell >> 64) as u64);
        }
    }
    words
}
