//! WASI Preview 1 syscall bodies.
//!
//! Every body has the same shape: check the capability (terminal trap when
//! missing), do the work against the instance memory, push a WASI errno.

use std::io::Read;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::RuntimeError;
use crate::host::HostScope;

use super::{fill_random, memory, seek_file, write_stdio, Capabilities, FdEntry, WasiCtx};

pub(super) const ERRNO_SUCCESS: u16 = 0;
pub(super) const ERRNO_BADF: u16 = 8;
pub(super) const ERRNO_INVAL: u16 = 28;
pub(super) const ERRNO_IO: u16 = 29;
pub(super) const ERRNO_NOENT: u16 = 44;
pub(super) const ERRNO_NOSYS: u16 = 52;

fn arg(scope: &HostScope<'_>, index: usize) -> u64 {
    scope.args.get(index).copied().unwrap_or_default()
}

fn finish(scope: &mut HostScope<'_>, result: Result<(), u16>) -> Result<(), RuntimeError> {
    let errno = match result {
        Ok(()) => ERRNO_SUCCESS,
        Err(errno) => errno,
    };
    scope.results.push(u64::from(errno));
    Ok(())
}

fn store_u32(
    scope: &HostScope<'_>,
    addr: u64,
    value: u32,
) -> Result<(), u16> {
    memory(scope)
        .map_err(|_| ERRNO_INVAL)?
        .store::<4>(addr, value.to_le_bytes())
        .map_err(|_| ERRNO_INVAL)
}

fn store_u64(scope: &HostScope<'_>, addr: u64, value: u64) -> Result<(), u16> {
    memory(scope)
        .map_err(|_| ERRNO_INVAL)?
        .store::<8>(addr, value.to_le_bytes())
        .map_err(|_| ERRNO_INVAL)
}

pub(super) fn args_sizes_get(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    let count = ctx.args.len() as u32;
    let bytes: u32 = ctx.args.iter().map(|a| a.len() as u32 + 1).sum();
    let result = store_u32(scope, arg(scope, 0), count)
        .and_then(|()| store_u32(scope, arg(scope, 1), bytes));
    finish(scope, result)
}

pub(super) fn args_get(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    let result = write_string_table(scope, arg(scope, 0), arg(scope, 1), &ctx.args);
    finish(scope, result)
}

pub(super) fn environ_sizes_get(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    ctx.require(Capabilities::ENV)?;
    let count = ctx.env.len() as u32;
    let bytes: u32 = ctx
        .env
        .iter()
        .map(|(k, v)| (k.len() + v.len() + 2) as u32)
        .sum();
    let result = store_u32(scope, arg(scope, 0), count)
        .and_then(|()| store_u32(scope, arg(scope, 1), bytes));
    finish(scope, result)
}

pub(super) fn environ_get(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    ctx.require(Capabilities::ENV)?;
    let entries: Vec<String> =
        ctx.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    let result = write_string_table(scope, arg(scope, 0), arg(scope, 1), &entries);
    finish(scope, result)
}

fn write_string_table(
    scope: &HostScope<'_>,
    ptrs_addr: u64,
    data_addr: u64,
    entries: &[String],
) -> Result<(), u16> {
    let mut cursor = data_addr;
    for (i, entry) in entries.iter().enumerate() {
        store_u32(scope, ptrs_addr + (i as u64) * 4, cursor as u32)?;
        let mem = memory(scope).map_err(|_| ERRNO_INVAL)?;
        mem.write_from(cursor, entry.as_bytes()).map_err(|_| ERRNO_INVAL)?;
        mem.store::<1>(cursor + entry.len() as u64, [0]).map_err(|_| ERRNO_INVAL)?;
        cursor += entry.len() as u64 + 1;
    }
    Ok(())
}

pub(super) fn clock_time_get(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    ctx.require(Capabilities::CLOCK)?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let result = store_u64(scope, arg(scope, 2), nanos);
    finish(scope, result)
}

pub(super) fn clock_res_get(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    ctx.require(Capabilities::CLOCK)?;
    let result = store_u64(scope, arg(scope, 1), 1_000);
    finish(scope, result)
}

pub(super) fn fd_write(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    let fd = arg(scope, 0) as u32;
    if fd <= 2 {
        ctx.require(Capabilities::STDIO)?;
    } else {
        ctx.require(Capabilities::FS_WRITE)?;
    }
    let result = (|| -> Result<(), u16> {
        let iovs = arg(scope, 1);
        let iovs_len = arg(scope, 2) as u32;
        let mem = memory(scope).map_err(|_| ERRNO_INVAL)?;
        let mut total = 0u32;
        for i in 0..u64::from(iovs_len) {
            let base = iovs + i * 8;
            let ptr =
                u32::from_le_bytes(mem.load::<4>(base).map_err(|_| ERRNO_INVAL)?);
            let len =
                u32::from_le_bytes(mem.load::<4>(base + 4).map_err(|_| ERRNO_INVAL)?);
            let mut buf = vec![0u8; len as usize];
            mem.read_into(u64::from(ptr), &mut buf).map_err(|_| ERRNO_INVAL)?;
            let written = ctx.with_fd(fd, |entry| match entry {
                FdEntry::Stdout => write_stdio(1, &buf),
                FdEntry::Stderr => write_stdio(2, &buf),
                FdEntry::Stdin | FdEntry::Preopen(_) => Err(ERRNO_BADF),
                FdEntry::File(file) => {
                    use std::io::Write;
                    file.write(&buf).map_err(|_| ERRNO_IO)
                }
            })?;
            total += written as u32;
        }
        store_u32(scope, arg(scope, 3), total)
    })();
    finish(scope, result)
}

pub(super) fn fd_read(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    let fd = arg(scope, 0) as u32;
    if fd <= 2 {
        ctx.require(Capabilities::STDIO)?;
    } else {
        ctx.require(Capabilities::FS_READ)?;
    }
    let result = (|| -> Result<(), u16> {
        let iovs = arg(scope, 1);
        let iovs_len = arg(scope, 2) as u32;
        let mem = memory(scope).map_err(|_| ERRNO_INVAL)?;
        let mut total = 0u32;
        for i in 0..u64::from(iovs_len) {
            let base = iovs + i * 8;
            let ptr =
                u32::from_le_bytes(mem.load::<4>(base).map_err(|_| ERRNO_INVAL)?);
            let len =
                u32::from_le_bytes(mem.load::<4>(base + 4).map_err(|_| ERRNO_INVAL)?);
            let mut buf = vec![0u8; len as usize];
            let read = ctx.with_fd(fd, |entry| match entry {
                FdEntry::Stdin => {
                    std::io::stdin().read(&mut buf).map_err(|_| ERRNO_IO)
                }
                FdEntry::File(file) => file.read(&mut buf).map_err(|_| ERRNO_IO),
                _ => Err(ERRNO_BADF),
            })?;
            mem.write_from(u64::from(ptr), &buf[..read]).map_err(|_| ERRNO_INVAL)?;
            total += read as u32;
            if read < len as usize {
                break;
            }
        }
        store_u32(scope, arg(scope, 3), total)
    })();
    finish(scope, result)
}

pub(super) fn fd_close(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    let fd = arg(scope, 0) as u32;
    let result = {
        let mut fds = ctx.fds.lock().unwrap_or_else(|e| e.into_inner());
        match fds.get_mut(fd as usize) {
            Some(slot @ Some(_)) if fd > 2 => {
                *slot = None;
                Ok(())
            }
            Some(Some(_)) => Ok(()),
            _ => Err(ERRNO_BADF),
        }
    };
    finish(scope, result)
}

pub(super) fn fd_seek(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    ctx.require(Capabilities::FS_READ)?;
    let fd = arg(scope, 0) as u32;
    let offset = arg(scope, 1) as i64;
    let whence = arg(scope, 2) as u8;
    let result = ctx
        .with_fd(fd, |entry| match entry {
            FdEntry::File(file) => seek_file(file, offset, whence),
            _ => Err(ERRNO_BADF),
        })
        .and_then(|pos| store_u64(scope, arg(scope, 3), pos));
    finish(scope, result)
}

pub(super) fn fd_fdstat_get(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    let fd = arg(scope, 0) as u32;
    let stat_addr = arg(scope, 1);
    let result = ctx
        .with_fd(fd, |entry| {
            Ok(match entry {
                FdEntry::Stdin | FdEntry::Stdout | FdEntry::Stderr => 2u8, // char dev
                FdEntry::Preopen(_) => 3,                                 // directory
                FdEntry::File(_) => 4,                                    // regular
            })
        })
        .and_then(|filetype| {
            // fdstat: filetype u8, flags u16, rights u64 x2.
            let mem = memory(scope).map_err(|_| ERRNO_INVAL)?;
            mem.store::<1>(stat_addr, [filetype]).map_err(|_| ERRNO_INVAL)?;
            mem.store::<1>(stat_addr + 1, [0]).map_err(|_| ERRNO_INVAL)?;
            mem.store::<2>(stat_addr + 2, [0, 0]).map_err(|_| ERRNO_INVAL)?;
            store_u64(scope, stat_addr + 8, u64::MAX)?;
            store_u64(scope, stat_addr + 16, u64::MAX)
        });
    finish(scope, result)
}

pub(super) fn fd_prestat_get(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    let fd = arg(scope, 0) as u32;
    let result = ctx
        .with_fd(fd, |entry| match entry {
            FdEntry::Preopen(path) => {
                Ok(path.as_os_str().to_string_lossy().len() as u32)
            }
            _ => Err(ERRNO_BADF),
        })
        .and_then(|name_len| {
            // prestat: tag 0 (dir), then the name length.
            store_u32(scope, arg(scope, 1), 0)?;
            store_u32(scope, arg(scope, 1) + 4, name_len)
        });
    finish(scope, result)
}

pub(super) fn fd_prestat_dir_name(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    let fd = arg(scope, 0) as u32;
    let path_addr = arg(scope, 1);
    let path_len = arg(scope, 2) as usize;
    let result = ctx
        .with_fd(fd, |entry| match entry {
            FdEntry::Preopen(path) => Ok(path.as_os_str().to_string_lossy().into_owned()),
            _ => Err(ERRNO_BADF),
        })
        .and_then(|name| {
            let bytes = name.as_bytes();
            if bytes.len() > path_len {
                return Err(ERRNO_INVAL);
            }
            memory(scope)
                .map_err(|_| ERRNO_INVAL)?
                .write_from(path_addr, bytes)
                .map_err(|_| ERRNO_INVAL)
        });
    finish(scope, result)
}

pub(super) fn path_open(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    ctx.require(Capabilities::PATH)?;
    let dirfd = arg(scope, 0) as u32;
    let path_addr = arg(scope, 2);
    let path_len = arg(scope, 3) as usize;
    let oflags = arg(scope, 4) as u16;
    let fd_out = arg(scope, 8);
    let result = (|| -> Result<(), u16> {
        let mut raw = vec![0u8; path_len];
        memory(scope)
            .map_err(|_| ERRNO_INVAL)?
            .read_into(path_addr, &mut raw)
            .map_err(|_| ERRNO_INVAL)?;
        let rel = String::from_utf8(raw).map_err(|_| ERRNO_INVAL)?;
        if rel.contains("..") {
            return Err(ERRNO_NOENT);
        }
        let base = ctx.with_fd(dirfd, |entry| match entry {
            FdEntry::Preopen(path) => Ok(path.clone()),
            _ => Err(ERRNO_BADF),
        })?;
        let full = base.join(&rel);
        let create = oflags & 0x1 != 0;
        let truncate = oflags & 0x8 != 0;
        let writable = ctx.caps.contains(Capabilities::FS_WRITE);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .create(create && writable)
            .truncate(truncate && writable)
            .open(&full)
            .map_err(|_| ERRNO_NOENT)?;
        let mut fds = ctx.fds.lock().unwrap_or_else(|e| e.into_inner());
        fds.push(Some(FdEntry::File(file)));
        let new_fd = (fds.len() - 1) as u32;
        drop(fds);
        store_u32(scope, fd_out, new_fd)
    })();
    finish(scope, result)
}

pub(super) fn random_get(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    ctx.require(Capabilities::RANDOM)?;
    let addr = arg(scope, 0);
    let len = arg(scope, 1) as usize;
    let result = (|| -> Result<(), u16> {
        let mut buf = vec![0u8; len];
        fill_random(&mut buf)?;
        memory(scope)
            .map_err(|_| ERRNO_INVAL)?
            .write_from(addr, &buf)
            .map_err(|_| ERRNO_INVAL)
    })();
    finish(scope, result)
}

/// Only clock subscriptions are supported: the call sleeps until the
/// earliest timeout and reports that event.
pub(super) fn poll_oneoff(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    ctx.require(Capabilities::CLOCK)?;
    let subs_addr = arg(scope, 0);
    let events_addr = arg(scope, 1);
    let nsubs = arg(scope, 2);
    let result = (|| -> Result<(), u16> {
        let mem = memory(scope).map_err(|_| ERRNO_INVAL)?;
        let mut shortest: Option<(u64, u64)> = None; // (userdata, nanos)
        for i in 0..nsubs {
            // subscription: userdata u64, tag u8, clock payload at +16.
            let base = subs_addr + i * 48;
            let userdata =
                u64::from_le_bytes(mem.load::<8>(base).map_err(|_| ERRNO_INVAL)?);
            let tag = mem.load::<1>(base + 8).map_err(|_| ERRNO_INVAL)?[0];
            if tag != 0 {
                return Err(ERRNO_NOSYS);
            }
            let timeout =
                u64::from_le_bytes(mem.load::<8>(base + 24).map_err(|_| ERRNO_INVAL)?);
            if shortest.is_none_or(|(_, t)| timeout < t) {
                shortest = Some((userdata, timeout));
            }
        }
        let Some((userdata, nanos)) = shortest else { return Err(ERRNO_INVAL) };
        std::thread::sleep(std::time::Duration::from_nanos(nanos));
        // event: userdata u64, errno u16, type u8.
        store_u64(scope, events_addr, userdata)?;
        mem.store::<2>(events_addr + 8, 0u16.to_le_bytes()).map_err(|_| ERRNO_INVAL)?;
        mem.store::<1>(events_addr + 10, [0]).map_err(|_| ERRNO_INVAL)?;
        store_u32(scope, arg(scope, 3), 1)
    })();
    finish(scope, result)
}

pub(super) fn proc_exit(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    ctx.require(Capabilities::PROC)?;
    let code = arg(scope, 0) as i32;
    ctx.record_exit(code);
    Err(RuntimeError::Exit(code))
}

pub(super) fn sched_yield(
    ctx: &Arc<WasiCtx>,
    scope: &mut HostScope<'_>,
) -> Result<(), RuntimeError> {
    ctx.require(Capabilities::PROC)?;
    std::thread::yield_now();
    finish(scope, Ok(()))
}
