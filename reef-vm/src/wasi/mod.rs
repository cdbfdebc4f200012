//! WASI Preview 1 surface.
//!
//! Syscalls are ordinary host functions wired through the import plumbing;
//! each one is gated by a capability bit fixed at instantiation and read
//! lock-free afterwards. A denied syscall terminates the invocation with
//! the capability trap; it never fakes success.

use std::io::{Read, Seek, SeekFrom, Write as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use reef_asm::TrapReason;
use reef_types::ValType;

use crate::error::RuntimeError;
use crate::host::{HostFunc, HostScope, ImportSet};
use crate::memory::LinearMemory;
use crate::module::FuncType;

mod syscall;

bitflags::bitflags! {
    /// WASI capability bits. Fixed at instantiation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// stdin/stdout/stderr access.
        const STDIO = 1 << 0;
        /// Reading preopened files.
        const FS_READ = 1 << 1;
        /// Writing preopened files.
        const FS_WRITE = 1 << 2;
        /// Environment access.
        const ENV = 1 << 3;
        /// `path_open` and directory traversal.
        const PATH = 1 << 4;
        /// Clock access.
        const CLOCK = 1 << 5;
        /// Random access.
        const RANDOM = 1 << 6;
        /// `proc_exit` and scheduling.
        const PROC = 1 << 7;
    }
}

impl Capabilities {
    /// The default set wired by `load_wasi`: stdio, clock, random, exit.
    pub fn default_set() -> Self {
        Self::STDIO | Self::CLOCK | Self::RANDOM | Self::PROC
    }
}

/// One open file descriptor.
enum FdEntry {
    Stdin,
    Stdout,
    Stderr,
    /// A preopened directory.
    Preopen(PathBuf),
    /// An open regular file.
    File(std::fs::File),
}

/// Per-instance WASI state.
pub struct WasiCtx {
    caps: Capabilities,
    args: Vec<String>,
    env: Vec<(String, String)>,
    fds: Mutex<Vec<Option<FdEntry>>>,
    exit_code: AtomicI64,
}

impl WasiCtx {
    /// Build a context with the given capabilities, arguments, environment
    /// entries, and preopened directories.
    pub fn new(
        caps: Capabilities,
        args: Vec<String>,
        env: Vec<(String, String)>,
        preopens: Vec<PathBuf>,
    ) -> Arc<Self> {
        let mut fds: Vec<Option<FdEntry>> =
            vec![Some(FdEntry::Stdin), Some(FdEntry::Stdout), Some(FdEntry::Stderr)];
        for dir in preopens {
            fds.push(Some(FdEntry::Preopen(dir)));
        }
        Arc::new(Self {
            caps,
            args,
            env,
            fds: Mutex::new(fds),
            exit_code: AtomicI64::new(i64::MIN),
        })
    }

    /// The capability set.
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// The exit code passed to `proc_exit`, when the program exited.
    pub fn exit_code(&self) -> Option<i32> {
        match self.exit_code.load(Ordering::Acquire) {
            i64::MIN => None,
            code => Some(code as i32),
        }
    }

    pub(crate) fn record_exit(&self, code: i32) {
        self.exit_code.store(i64::from(code), Ordering::Release);
    }

    fn require(&self, cap: Capabilities) -> Result<(), RuntimeError> {
        if self.caps.contains(cap) {
            Ok(())
        } else {
            Err(RuntimeError::Trap(TrapReason::WasiCapabilityDenied))
        }
    }

    fn with_fd<R>(
        &self,
        fd: u32,
        f: impl FnOnce(&mut FdEntry) -> Result<R, u16>,
    ) -> Result<R, u16> {
        let mut fds = self.fds.lock().unwrap_or_else(|e| e.into_inner());
        match fds.get_mut(fd as usize) {
            Some(Some(entry)) => f(entry),
            _ => Err(syscall::ERRNO_BADF),
        }
    }
}

/// Build the import set exposing this context as `wasi_snapshot_preview1`.
pub fn import_set(ctx: &Arc<WasiCtx>) -> ImportSet {
    use ValType::{I32, I64};

    let mut set = ImportSet::new();
    let mut add = |name: &str,
                   params: &[ValType],
                   results: &[ValType],
                   f: Box<
        dyn Fn(&Arc<WasiCtx>, &mut HostScope<'_>) -> Result<(), RuntimeError>
            + Send
            + Sync,
    >| {
        let ctx = Arc::clone(ctx);
        set.push(HostFunc::wrap(
            "wasi_snapshot_preview1",
            name,
            FuncType { params: params.to_vec(), results: results.to_vec() },
            move |scope| f(&ctx, scope),
        ));
    };

    add("args_sizes_get", &[I32, I32], &[I32], Box::new(syscall::args_sizes_get));
    add("args_get", &[I32, I32], &[I32], Box::new(syscall::args_get));
    add(
        "environ_sizes_get",
        &[I32, I32],
        &[I32],
        Box::new(syscall::environ_sizes_get),
    );
    add("environ_get", &[I32, I32], &[I32], Box::new(syscall::environ_get));
    add(
        "clock_time_get",
        &[I32, I64, I32],
        &[I32],
        Box::new(syscall::clock_time_get),
    );
    add("clock_res_get", &[I32, I32], &[I32], Box::new(syscall::clock_res_get));
    add("fd_write", &[I32, I32, I32, I32], &[I32], Box::new(syscall::fd_write));
    add("fd_read", &[I32, I32, I32, I32], &[I32], Box::new(syscall::fd_read));
    add("fd_close", &[I32], &[I32], Box::new(syscall::fd_close));
    add("fd_seek", &[I32, I64, I32, I32], &[I32], Box::new(syscall::fd_seek));
    add("fd_fdstat_get", &[I32, I32], &[I32], Box::new(syscall::fd_fdstat_get));
    add("fd_prestat_get", &[I32, I32], &[I32], Box::new(syscall::fd_prestat_get));
    add(
        "fd_prestat_dir_name",
        &[I32, I32, I32],
        &[I32],
        Box::new(syscall::fd_prestat_dir_name),
    );
    add(
        "path_open",
        &[I32, I32, I32, I32, I32, I64, I64, I32, I32],
        &[I32],
        Box::new(syscall::path_open),
    );
    add("random_get", &[I32, I32], &[I32], Box::new(syscall::random_get));
    add(
        "poll_oneoff",
        &[I32, I32, I32, I32],
        &[I32],
        Box::new(syscall::poll_oneoff),
    );
    add("proc_exit", &[I32], &[], Box::new(syscall::proc_exit));
    add("sched_yield", &[], &[I32], Box::new(syscall::sched_yield));
    set
}

/// Memory view helper shared by the syscall bodies.
fn memory<'a>(scope: &'a HostScope<'_>) -> Result<&'a Arc<LinearMemory>, RuntimeError> {
    scope
        .memory
        .ok_or(RuntimeError::Trap(TrapReason::OutOfBoundsMemoryAccess))
}

/// Host randomness without dragging in an RNG dependency: read the
/// platform's entropy device once per request.
fn fill_random(buf: &mut [u8]) -> Result<(), u16> {
    static URANDOM: OnceLock<Option<Mutex<std::fs::File>>> = OnceLock::new();
    let file = URANDOM.get_or_init(|| {
        std::fs::File::open("/dev/urandom").ok().map(Mutex::new)
    });
    match file {
        Some(file) => {
            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
            file.read_exact(buf).map_err(|_| syscall::ERRNO_IO)
        }
        None => Err(syscall::ERRNO_NOSYS),
    }
}

fn seek_file(file: &mut std::fs::File, offset: i64, whence: u8) -> Result<u64, u16> {
    let pos = match whence {
        0 => SeekFrom::Start(offset as u64),
        1 => SeekFrom::Current(offset),
        2 => SeekFrom::End(offset),
        _ => return Err(syscall::ERRNO_INVAL),
    };
    file.seek(pos).map_err(|_| syscall::ERRNO_IO)
}

fn write_stdio(fd: u32, bytes: &[u8]) -> Result<usize, u16> {
    match fd {
        1 => std::io::stdout()
            .write(bytes)
            .map_err(|_| syscall::ERRNO_IO),
        _ => std::io::stderr()
            .write(bytes)
            .map_err(|_| syscall::ERRNO_IO),
    }
}
