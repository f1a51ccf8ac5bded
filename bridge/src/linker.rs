//! System-call emulation registered on the import surface.
//!
//! Registers every `wasi_snapshot_preview1` function, so any command-style
//! guest (Go `wasip1`, wasi-libc) links. Process state, clocks, entropy,
//! `poll_oneoff` and the three stdio descriptors are emulated. There is no
//! filesystem and no network: there are no preopens, so every other
//! descriptor is `Badf`, and operations stdio cannot support are `Nosys`.
//!
//! Each emulated function:
//! 1. Extracts memory and `HostState` from the Caller
//! 2. Validates pointer/length arguments against linear memory
//! 3. Performs the operation
//! 4. Returns a WASI errno (0 = success)
//!
//! `proc_exit` is the exception: it unwinds the guest with `GuestExit`.

use std::time::Duration;

use rand::RngCore;
use tracing::{trace, warn};
use wasmtime::{Caller, Memory};

use crate::error::{BridgeError, Errno, GuestExit};
use crate::host_state::HostState;
use crate::memory;
use crate::surface::{HostContext, ImportSurface};

/// Import module name of the emulated system interface.
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

type Ctx = HostContext<HostState>;

const CLOCK_REALTIME: i32 = 0;
const CLOCK_MONOTONIC: i32 = 1;
const CLOCK_PROCESS_CPUTIME: i32 = 2;
const CLOCK_THREAD_CPUTIME: i32 = 3;

const STDIN: i32 = 0;

const FILETYPE_CHARACTER_DEVICE: u8 = 2;
const RIGHT_FD_READ: u64 = 1 << 1;
const RIGHT_FD_WRITE: u64 = 1 << 6;
const RIGHT_POLL_FD_READWRITE: u64 = 1 << 27;

const SUBSCRIPTION_SIZE: u32 = 48;
const EVENT_SIZE: u32 = 32;
const EVENTTYPE_CLOCK: u8 = 0;
const EVENTTYPE_FD_READ: u8 = 1;
const EVENTTYPE_FD_WRITE: u8 = 2;
const SUBCLOCKFLAG_ABSTIME: u16 = 1;
const EVENTRWFLAG_HANGUP: u16 = 1;

fn is_stdio(fd: i32) -> bool {
    (0..=2).contains(&fd)
}

/// Result for descriptor operations stdio cannot perform.
fn stdio_unsupported(fd: i32) -> i32 {
    if is_stdio(fd) {
        Errno::Nosys.as_i32()
    } else {
        Errno::Badf.as_i32()
    }
}

/// Current value of `clock_id`, or `None` for an unknown clock.
fn clock_now(state: &HostState, clock_id: i32) -> Option<u64> {
    match clock_id {
        CLOCK_REALTIME => Some(state.realtime_nanos()),
        // CPU-time clocks fall back to wall-clock elapsed time.
        CLOCK_MONOTONIC | CLOCK_PROCESS_CPUTIME | CLOCK_THREAD_CPUTIME => {
            Some(state.monotonic_nanos())
        }
        _ => None,
    }
}

/// Get the guest's exported memory from a Caller.
fn get_memory(caller: &mut Caller<'_, Ctx>) -> Option<Memory> {
    caller.get_export("memory").and_then(|e| e.into_memory())
}

fn errno(result: Result<(), Errno>) -> i32 {
    match result {
        Ok(()) => Errno::Success.as_i32(),
        Err(e) => e.as_i32(),
    }
}

/// Register every emulated WASI function on `surface`.
pub fn register_wasi(surface: &mut ImportSurface<HostState>) -> Result<(), BridgeError> {
    register_args(surface)?;
    register_environ(surface)?;
    register_clocks(surface)?;
    register_fd_write(surface)?;
    register_stdio(surface)?;
    register_poll_oneoff(surface)?;
    register_random_get(surface)?;
    register_sched_yield(surface)?;
    register_proc_exit(surface)?;
    register_unsupported(surface)?;
    Ok(())
}

// ── Arguments & Environment ──

fn string_table_sizes(
    caller: &mut Caller<'_, Ctx>,
    count_ptr: i32,
    size_ptr: i32,
    select: fn(&HostState) -> &Vec<Vec<u8>>,
) -> i32 {
    let mem = match get_memory(caller) {
        Some(m) => m,
        None => return Errno::Fault.as_i32(),
    };
    let (data, ctx) = mem.data_and_store_mut(caller);
    let entries = select(&ctx.state);
    errno(
        memory::write_u32(data, count_ptr, entries.len() as u32)
            .and_then(|()| memory::write_u32(data, size_ptr, memory::table_size(entries) as u32)),
    )
}

fn string_table_get(
    caller: &mut Caller<'_, Ctx>,
    ptrs_ptr: i32,
    buf_ptr: i32,
    select: fn(&HostState) -> &Vec<Vec<u8>>,
) -> i32 {
    let mem = match get_memory(caller) {
        Some(m) => m,
        None => return Errno::Fault.as_i32(),
    };
    let (data, ctx) = mem.data_and_store_mut(caller);
    errno(memory::write_string_table(
        data,
        ptrs_ptr,
        buf_ptr,
        select(&ctx.state),
    ))
}

fn register_args(surface: &mut ImportSurface<HostState>) -> Result<(), BridgeError> {
    surface.func_wrap(
        WASI_MODULE,
        "args_sizes_get",
        |mut caller: Caller<'_, Ctx>, argc_ptr: i32, buf_size_ptr: i32| -> i32 {
            string_table_sizes(&mut caller, argc_ptr, buf_size_ptr, |s| &s.args)
        },
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "args_get",
        |mut caller: Caller<'_, Ctx>, argv_ptr: i32, buf_ptr: i32| -> i32 {
            string_table_get(&mut caller, argv_ptr, buf_ptr, |s| &s.args)
        },
    )?;
    Ok(())
}

fn register_environ(surface: &mut ImportSurface<HostState>) -> Result<(), BridgeError> {
    surface.func_wrap(
        WASI_MODULE,
        "environ_sizes_get",
        |mut caller: Caller<'_, Ctx>, count_ptr: i32, buf_size_ptr: i32| -> i32 {
            string_table_sizes(&mut caller, count_ptr, buf_size_ptr, |s| &s.env)
        },
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "environ_get",
        |mut caller: Caller<'_, Ctx>, environ_ptr: i32, buf_ptr: i32| -> i32 {
            string_table_get(&mut caller, environ_ptr, buf_ptr, |s| &s.env)
        },
    )?;
    Ok(())
}

// ── Clocks ──

fn register_clocks(surface: &mut ImportSurface<HostState>) -> Result<(), BridgeError> {
    surface.func_wrap(
        WASI_MODULE,
        "clock_time_get",
        |mut caller: Caller<'_, Ctx>, clock_id: i32, _precision: i64, time_ptr: i32| -> i32 {
            let mem = match get_memory(&mut caller) {
                Some(m) => m,
                None => return Errno::Fault.as_i32(),
            };
            let (data, ctx) = mem.data_and_store_mut(&mut caller);
            let now = match clock_now(&ctx.state, clock_id) {
                Some(now) => now,
                None => return Errno::Inval.as_i32(),
            };
            errno(memory::write_u64(data, time_ptr, now))
        },
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "clock_res_get",
        |mut caller: Caller<'_, Ctx>, clock_id: i32, res_ptr: i32| -> i32 {
            if !(CLOCK_REALTIME..=CLOCK_THREAD_CPUTIME).contains(&clock_id) {
                return Errno::Inval.as_i32();
            }
            let mem = match get_memory(&mut caller) {
                Some(m) => m,
                None => return Errno::Fault.as_i32(),
            };
            errno(memory::write_u64(mem.data_mut(&mut caller), res_ptr, 1))
        },
    )?;
    Ok(())
}

// ── Output ──

fn register_fd_write(surface: &mut ImportSurface<HostState>) -> Result<(), BridgeError> {
    surface.func_wrap(
        WASI_MODULE,
        "fd_write",
        |mut caller: Caller<'_, Ctx>,
         fd: i32,
         iovs_ptr: i32,
         iovs_len: i32,
         nwritten_ptr: i32|
         -> i32 {
            let mem = match get_memory(&mut caller) {
                Some(m) => m,
                None => return Errno::Fault.as_i32(),
            };
            let (data, ctx) = mem.data_and_store_mut(&mut caller);

            let (sink, is_stderr) = match ctx.state.sink_for(fd) {
                Some(s) => s,
                None => return Errno::Badf.as_i32(),
            };

            let (ranges, total) = match memory::iovec_ranges(data, iovs_ptr, iovs_len) {
                Ok(r) => r,
                Err(e) => return e.as_i32(),
            };

            for range in ranges {
                if let Err(e) = sink.write(&data[range], is_stderr) {
                    warn!(fd, error = %e, "guest output write failed");
                    return Errno::Io.as_i32();
                }
            }
            trace!(fd, len = total, "fd_write");

            errno(memory::write_u32(data, nwritten_ptr, total))
        },
    )?;
    Ok(())
}

// ── Stdio descriptors ──

fn register_stdio(surface: &mut ImportSurface<HostState>) -> Result<(), BridgeError> {
    surface.func_wrap(
        WASI_MODULE,
        "fd_fdstat_get",
        |mut caller: Caller<'_, Ctx>, fd: i32, stat_ptr: i32| -> i32 {
            let rights = match fd {
                STDIN => RIGHT_FD_READ | RIGHT_POLL_FD_READWRITE,
                1 | 2 => RIGHT_FD_WRITE | RIGHT_POLL_FD_READWRITE,
                _ => return Errno::Badf.as_i32(),
            };
            let mem = match get_memory(&mut caller) {
                Some(m) => m,
                None => return Errno::Fault.as_i32(),
            };
            // fdstat: filetype u8, flags u16 at 2, rights_base u64 at 8,
            // rights_inheriting u64 at 16.
            let mut stat = [0u8; 24];
            stat[0] = FILETYPE_CHARACTER_DEVICE;
            stat[8..16].copy_from_slice(&rights.to_le_bytes());
            errno(memory::write_bytes(mem.data_mut(&mut caller), stat_ptr, &stat))
        },
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "fd_fdstat_set_flags",
        |fd: i32, _flags: i32| -> i32 {
            // Accepted and ignored: stdio never blocks the guest.
            if is_stdio(fd) {
                Errno::Success.as_i32()
            } else {
                Errno::Badf.as_i32()
            }
        },
    )?;
    // No preopened directories.
    surface.func_wrap(WASI_MODULE, "fd_prestat_get", |_fd: i32, _buf: i32| -> i32 {
        Errno::Badf.as_i32()
    })?;
    surface.func_wrap(
        WASI_MODULE,
        "fd_prestat_dir_name",
        |_fd: i32, _path: i32, _path_len: i32| -> i32 { Errno::Badf.as_i32() },
    )?;
    surface.func_wrap(WASI_MODULE, "fd_close", |fd: i32| -> i32 {
        if is_stdio(fd) {
            Errno::Success.as_i32()
        } else {
            Errno::Badf.as_i32()
        }
    })?;
    surface.func_wrap(
        WASI_MODULE,
        "fd_read",
        |mut caller: Caller<'_, Ctx>, fd: i32, iovs_ptr: i32, iovs_len: i32, nread_ptr: i32| -> i32 {
            if fd != STDIN {
                return stdio_unsupported(fd);
            }
            let mem = match get_memory(&mut caller) {
                Some(m) => m,
                None => return Errno::Fault.as_i32(),
            };
            let data = mem.data_mut(&mut caller);
            // Stdin is always at end of input.
            if let Err(e) = memory::iovec_ranges(data, iovs_ptr, iovs_len) {
                return e.as_i32();
            }
            errno(memory::write_u32(data, nread_ptr, 0))
        },
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "fd_seek",
        |fd: i32, _offset: i64, _whence: i32, _new_offset: i32| -> i32 {
            if is_stdio(fd) {
                Errno::Spipe.as_i32()
            } else {
                Errno::Badf.as_i32()
            }
        },
    )?;
    surface.func_wrap(WASI_MODULE, "fd_tell", |fd: i32, _offset: i32| -> i32 {
        if is_stdio(fd) {
            Errno::Spipe.as_i32()
        } else {
            Errno::Badf.as_i32()
        }
    })?;
    Ok(())
}

// ── Polling ──

/// One decoded `subscription`.
enum Subscription {
    Clock { userdata: u64, clock_id: i32, timeout: u64, abstime: bool },
    Fd { userdata: u64, kind: u8, fd: i32 },
}

fn read_subscriptions(mem: &[u8], in_ptr: i32, count: u32) -> Result<Vec<Subscription>, Errno> {
    let table_len = count.checked_mul(SUBSCRIPTION_SIZE).ok_or(Errno::Overflow)?;
    memory::range(mem.len(), in_ptr, table_len)?;

    let mut subs = Vec::with_capacity(count as usize);
    for i in 0..count {
        let base = (in_ptr as u32).wrapping_add(i * SUBSCRIPTION_SIZE) as i32;
        let userdata = memory::read_u64(mem, base)?;
        let tag = memory::read_bytes(mem, base.wrapping_add(8), 1)?[0];
        let payload = base.wrapping_add(16);
        let sub = match tag {
            EVENTTYPE_CLOCK => {
                let flags = memory::read_bytes(mem, payload.wrapping_add(24), 2)?;
                Subscription::Clock {
                    userdata,
                    clock_id: memory::read_u32(mem, payload)? as i32,
                    timeout: memory::read_u64(mem, payload.wrapping_add(8))?,
                    abstime: u16::from_le_bytes([flags[0], flags[1]]) & SUBCLOCKFLAG_ABSTIME != 0,
                }
            }
            EVENTTYPE_FD_READ | EVENTTYPE_FD_WRITE => Subscription::Fd {
                userdata,
                kind: tag,
                fd: memory::read_u32(mem, payload)? as i32,
            },
            _ => return Err(Errno::Inval),
        };
        subs.push(sub);
    }
    Ok(subs)
}

fn event(userdata: u64, error: Errno, kind: u8, flags: u16) -> [u8; EVENT_SIZE as usize] {
    let mut out = [0u8; EVENT_SIZE as usize];
    out[0..8].copy_from_slice(&userdata.to_le_bytes());
    out[8..10].copy_from_slice(&(error.as_i32() as u16).to_le_bytes());
    out[10] = kind;
    out[24..26].copy_from_slice(&flags.to_le_bytes());
    out
}

/// Resolve `subs` into events, sleeping for the nearest clock deadline
/// when no descriptor is ready.
fn poll(state: &HostState, subs: &[Subscription]) -> Vec<[u8; EVENT_SIZE as usize]> {
    let mut ready = Vec::new();
    let mut clocks = Vec::new();

    for sub in subs {
        match *sub {
            Subscription::Fd { userdata, kind, fd } => {
                let (error, flags) = match (kind, fd) {
                    (EVENTTYPE_FD_READ, STDIN) => (Errno::Success, EVENTRWFLAG_HANGUP),
                    (EVENTTYPE_FD_WRITE, 1 | 2) => (Errno::Success, 0),
                    _ => (Errno::Badf, 0),
                };
                ready.push(event(userdata, error, kind, flags));
            }
            Subscription::Clock { userdata, clock_id, timeout, abstime } => {
                match clock_now(state, clock_id) {
                    Some(now) => {
                        let wait = if abstime { timeout.saturating_sub(now) } else { timeout };
                        clocks.push((userdata, wait));
                    }
                    None => ready.push(event(userdata, Errno::Inval, EVENTTYPE_CLOCK, 0)),
                }
            }
        }
    }

    if ready.is_empty() {
        if let Some(nearest) = clocks.iter().map(|(_, wait)| *wait).min() {
            std::thread::sleep(Duration::from_nanos(nearest));
            ready.extend(
                clocks
                    .iter()
                    .filter(|(_, wait)| *wait <= nearest)
                    .map(|(userdata, _)| event(*userdata, Errno::Success, EVENTTYPE_CLOCK, 0)),
            );
        }
    }
    ready
}

fn register_poll_oneoff(surface: &mut ImportSurface<HostState>) -> Result<(), BridgeError> {
    surface.func_wrap(
        WASI_MODULE,
        "poll_oneoff",
        |mut caller: Caller<'_, Ctx>, in_ptr: i32, out_ptr: i32, nsubscriptions: i32, nevents_ptr: i32| -> i32 {
            let count = match u32::try_from(nsubscriptions) {
                Ok(0) | Err(_) => return Errno::Inval.as_i32(),
                Ok(n) => n,
            };
            let mem = match get_memory(&mut caller) {
                Some(m) => m,
                None => return Errno::Fault.as_i32(),
            };
            let (data, ctx) = mem.data_and_store_mut(&mut caller);
            let subs = match read_subscriptions(data, in_ptr, count) {
                Ok(s) => s,
                Err(e) => return e.as_i32(),
            };
            if let Err(e) = memory::range(data.len(), out_ptr, count * EVENT_SIZE) {
                return e.as_i32();
            }

            let events = poll(&ctx.state, &subs);
            trace!(subscriptions = count, events = events.len(), "poll_oneoff");

            for (i, ev) in events.iter().enumerate() {
                let at = (out_ptr as u32).wrapping_add(i as u32 * EVENT_SIZE) as i32;
                if let Err(e) = memory::write_bytes(data, at, ev) {
                    return e.as_i32();
                }
            }
            errno(memory::write_u32(data, nevents_ptr, events.len() as u32))
        },
    )?;
    Ok(())
}

// ── Entropy & Scheduling ──

fn register_random_get(surface: &mut ImportSurface<HostState>) -> Result<(), BridgeError> {
    surface.func_wrap(
        WASI_MODULE,
        "random_get",
        |mut caller: Caller<'_, Ctx>, buf_ptr: i32, buf_len: i32| -> i32 {
            let mem = match get_memory(&mut caller) {
                Some(m) => m,
                None => return Errno::Fault.as_i32(),
            };
            let data = mem.data_mut(&mut caller);
            let range = match memory::range(data.len(), buf_ptr, buf_len as u32) {
                Ok(r) => r,
                Err(e) => return e.as_i32(),
            };
            rand::thread_rng().fill_bytes(&mut data[range]);
            Errno::Success.as_i32()
        },
    )?;
    Ok(())
}

fn register_sched_yield(surface: &mut ImportSurface<HostState>) -> Result<(), BridgeError> {
    surface.func_wrap(WASI_MODULE, "sched_yield", || -> i32 {
        std::thread::yield_now();
        Errno::Success.as_i32()
    })?;
    Ok(())
}

// ── Process ──

fn register_proc_exit(surface: &mut ImportSurface<HostState>) -> Result<(), BridgeError> {
    surface.func_wrap(
        WASI_MODULE,
        "proc_exit",
        |_caller: Caller<'_, Ctx>, code: i32| -> anyhow::Result<()> {
            Err(GuestExit(code).into())
        },
    )?;
    Ok(())
}

// ── Filesystem & Sockets ──

/// Everything without a host counterpart. Descriptor arguments are checked
/// first so stdio and unknown descriptors are told apart.
fn register_unsupported(surface: &mut ImportSurface<HostState>) -> Result<(), BridgeError> {
    let badf = Errno::Badf.as_i32();

    // Descriptor operations.
    surface.func_wrap(WASI_MODULE, "fd_advise", |fd: i32, _: i64, _: i64, _: i32| {
        stdio_unsupported(fd)
    })?;
    surface.func_wrap(WASI_MODULE, "fd_allocate", |fd: i32, _: i64, _: i64| {
        stdio_unsupported(fd)
    })?;
    surface.func_wrap(WASI_MODULE, "fd_datasync", |fd: i32| stdio_unsupported(fd))?;
    surface.func_wrap(WASI_MODULE, "fd_sync", |fd: i32| stdio_unsupported(fd))?;
    surface.func_wrap(WASI_MODULE, "fd_fdstat_set_rights", |fd: i32, _: i64, _: i64| {
        stdio_unsupported(fd)
    })?;
    surface.func_wrap(WASI_MODULE, "fd_filestat_get", |fd: i32, _: i32| {
        stdio_unsupported(fd)
    })?;
    surface.func_wrap(WASI_MODULE, "fd_filestat_set_size", |fd: i32, _: i64| {
        stdio_unsupported(fd)
    })?;
    surface.func_wrap(
        WASI_MODULE,
        "fd_filestat_set_times",
        |fd: i32, _: i64, _: i64, _: i32| stdio_unsupported(fd),
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "fd_pread",
        |fd: i32, _: i32, _: i32, _: i64, _: i32| stdio_unsupported(fd),
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "fd_pwrite",
        |fd: i32, _: i32, _: i32, _: i64, _: i32| stdio_unsupported(fd),
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "fd_readdir",
        |fd: i32, _: i32, _: i32, _: i64, _: i32| stdio_unsupported(fd),
    )?;
    surface.func_wrap(WASI_MODULE, "fd_renumber", |fd: i32, _: i32| {
        stdio_unsupported(fd)
    })?;

    // Paths resolve against a directory descriptor; there are none.
    surface.func_wrap(WASI_MODULE, "path_create_directory", move |_: i32, _: i32, _: i32| badf)?;
    surface.func_wrap(
        WASI_MODULE,
        "path_filestat_get",
        move |_: i32, _: i32, _: i32, _: i32, _: i32| badf,
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "path_filestat_set_times",
        move |_: i32, _: i32, _: i32, _: i32, _: i64, _: i64, _: i32| badf,
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "path_link",
        move |_: i32, _: i32, _: i32, _: i32, _: i32, _: i32, _: i32| badf,
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "path_open",
        move |_: i32, _: i32, _: i32, _: i32, _: i32, _: i64, _: i64, _: i32, _: i32| badf,
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "path_readlink",
        move |_: i32, _: i32, _: i32, _: i32, _: i32, _: i32| badf,
    )?;
    surface.func_wrap(WASI_MODULE, "path_remove_directory", move |_: i32, _: i32, _: i32| badf)?;
    surface.func_wrap(
        WASI_MODULE,
        "path_rename",
        move |_: i32, _: i32, _: i32, _: i32, _: i32, _: i32| badf,
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "path_symlink",
        move |_: i32, _: i32, _: i32, _: i32, _: i32| badf,
    )?;
    surface.func_wrap(WASI_MODULE, "path_unlink_file", move |_: i32, _: i32, _: i32| badf)?;

    // Sockets and signals.
    surface.func_wrap(WASI_MODULE, "sock_accept", |fd: i32, _: i32, _: i32| {
        stdio_unsupported(fd)
    })?;
    surface.func_wrap(
        WASI_MODULE,
        "sock_recv",
        |fd: i32, _: i32, _: i32, _: i32, _: i32, _: i32| stdio_unsupported(fd),
    )?;
    surface.func_wrap(
        WASI_MODULE,
        "sock_send",
        |fd: i32, _: i32, _: i32, _: i32, _: i32| stdio_unsupported(fd),
    )?;
    surface.func_wrap(WASI_MODULE, "sock_shutdown", |fd: i32, _: i32| {
        stdio_unsupported(fd)
    })?;
    surface.func_wrap(WASI_MODULE, "proc_raise", |_sig: i32| Errno::Nosys.as_i32())?;
    Ok(())
}
