//! Safe WASM linear memory read/write helpers with bounds checking.
//!
//! Guest pointers arrive as `i32` but are unsigned 32-bit offsets in the
//! WASI ABI. Every helper validates `[ptr, ptr+len)` against the memory
//! slice before touching it; out-of-bounds access returns `Errno::Fault`.

use std::ops::Range;

use crate::error::Errno;

/// Size in bytes of a WASI `ciovec` (buf: u32, len: u32).
pub const IOVEC_SIZE: u32 = 8;

/// Resolve `[ptr, ptr+len)` to a byte range inside memory of `mem_len` bytes.
pub fn range(mem_len: usize, ptr: i32, len: u32) -> Result<Range<usize>, Errno> {
    let start = ptr as u32 as usize;
    let end = start.checked_add(len as usize).ok_or(Errno::Fault)?;
    if end > mem_len {
        return Err(Errno::Fault);
    }
    Ok(start..end)
}

/// Borrow `len` bytes of guest memory at `ptr`.
pub fn read_bytes(mem: &[u8], ptr: i32, len: u32) -> Result<&[u8], Errno> {
    let r = range(mem.len(), ptr, len)?;
    Ok(&mem[r])
}

/// Write `data` to guest memory at `ptr`.
pub fn write_bytes(mem: &mut [u8], ptr: i32, data: &[u8]) -> Result<(), Errno> {
    let len = u32::try_from(data.len()).map_err(|_| Errno::Overflow)?;
    let r = range(mem.len(), ptr, len)?;
    mem[r].copy_from_slice(data);
    Ok(())
}

/// Read a little-endian u32 from guest memory at `ptr`.
pub fn read_u32(mem: &[u8], ptr: i32) -> Result<u32, Errno> {
    let b = read_bytes(mem, ptr, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Read a little-endian u64 from guest memory at `ptr`.
pub fn read_u64(mem: &[u8], ptr: i32) -> Result<u64, Errno> {
    let b = read_bytes(mem, ptr, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Ok(u64::from_le_bytes(raw))
}

/// Write a little-endian u32 to guest memory at `ptr`.
pub fn write_u32(mem: &mut [u8], ptr: i32, value: u32) -> Result<(), Errno> {
    write_bytes(mem, ptr, &value.to_le_bytes())
}

/// Write a little-endian u64 to guest memory at `ptr`.
pub fn write_u64(mem: &mut [u8], ptr: i32, value: u64) -> Result<(), Errno> {
    write_bytes(mem, ptr, &value.to_le_bytes())
}

/// Resolve an array of `iovs_len` ciovecs at `iovs_ptr` to byte ranges,
/// with their combined length.
///
/// Nothing is copied: ranges may overlap, and the caller writes each one
/// straight from guest memory. The total must fit in a u32.
pub fn iovec_ranges(mem: &[u8], iovs_ptr: i32, iovs_len: i32) -> Result<(Vec<Range<usize>>, u32), Errno> {
    let count = u32::try_from(iovs_len).map_err(|_| Errno::Inval)?;
    let table_len = count.checked_mul(IOVEC_SIZE).ok_or(Errno::Overflow)?;
    range(mem.len(), iovs_ptr, table_len)?;

    let mut ranges = Vec::with_capacity(count as usize);
    let mut total: u32 = 0;
    for i in 0..count {
        let entry = (iovs_ptr as u32).wrapping_add(i * IOVEC_SIZE) as i32;
        let buf = read_u32(mem, entry)?;
        let len = read_u32(mem, entry.wrapping_add(4))?;
        total = total.checked_add(len).ok_or(Errno::Overflow)?;
        ranges.push(range(mem.len(), buf as i32, len)?);
    }
    Ok((ranges, total))
}

/// Total byte size of a NUL-terminated string table.
pub fn table_size(entries: &[Vec<u8>]) -> usize {
    entries.iter().map(Vec::len).sum()
}

/// Lay out a string table the way `args_get` / `environ_get` expect:
/// one u32 pointer per entry at `ptrs_ptr`, the entries themselves packed
/// back to back starting at `buf_ptr`. Entries must already carry their
/// trailing NUL.
pub fn write_string_table(
    mem: &mut [u8],
    ptrs_ptr: i32,
    buf_ptr: i32,
    entries: &[Vec<u8>],
) -> Result<(), Errno> {
    let ptrs_len = u32::try_from(entries.len() * 4).map_err(|_| Errno::Overflow)?;
    let buf_len = u32::try_from(table_size(entries)).map_err(|_| Errno::Overflow)?;
    range(mem.len(), ptrs_ptr, ptrs_len)?;
    range(mem.len(), buf_ptr, buf_len)?;

    let mut cursor = buf_ptr as u32;
    for (i, entry) in entries.iter().enumerate() {
        write_u32(mem, (ptrs_ptr as u32 + (i as u32) * 4) as i32, cursor)?;
        write_bytes(mem, cursor as i32, entry)?;
        cursor += entry.len() as u32;
    }
    Ok(())
}
