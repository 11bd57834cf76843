//! Block I/O engine
//!
//! A file's on-disk content is a sequence of `block_size` byte blocks, each
//! ciphered on its own at keystream position `index * block_size`. Only the
//! last block may be shorter. Reads decrypt whole blocks and copy out the
//! requested slice. Writes that do not cover a whole block read it back
//! first so the untouched bytes survive.

use crate::crypto::CipherContext;
use crate::error::{Error, Result};
use crate::session::Session;
use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::unix::fs::FileExt;
use tracing::debug;

/// Positional access to the on-disk representation of one file
pub trait BlockFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Current on-disk length
    fn len(&self) -> io::Result<u64>;

    fn set_len(&self, size: u64) -> io::Result<()>;
}

impl BlockFile for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        FileExt::read_at(self, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        FileExt::write_at(self, buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_len(&self, size: u64) -> io::Result<()> {
        File::set_len(self, size)
    }
}

/// Allocate a zeroed buffer, reporting allocation failure as an error
pub fn alloc_buffer(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::MemoryExhaustion)?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Read until `buf` is full or end of file, returning the bytes read
fn read_full<F: BlockFile + ?Sized>(file: &F, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn write_full<F: BlockFile + ?Sized>(file: &F, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut total = 0;
    while total < buf.len() {
        match file.write_at(&buf[total..], offset + total as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "block write made no progress",
                ))
            }
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read and decrypt `buf.len()` logical bytes starting at `offset`.
///
/// Returns the number of bytes copied, which is short at end of file.
pub fn read<F: BlockFile + ?Sized>(
    session: &Session,
    ctx: &mut CipherContext,
    file: &F,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let block_size = session.block_size() as u64;
    let end = offset + buf.len() as u64;
    let mut block = offset / block_size;
    let mut block_buf = alloc_buffer(session.block_size())?;
    let mut copied = 0;

    while block * block_size < end {
        let block_start = block * block_size;
        let n = read_full(file, &mut block_buf, block_start).map_err(Error::ReadFailure)?;

        let lo = offset.saturating_sub(block_start) as usize;
        let hi = (end - block_start).min(block_size) as usize;

        // End of file before the requested slice
        if n <= lo {
            break;
        }

        ctx.decrypt_at(block_start, &mut block_buf[..n]);
        let take = n.min(hi);
        buf[copied..copied + (take - lo)].copy_from_slice(&block_buf[lo..take]);
        copied += take - lo;

        if n < hi {
            break;
        }
        block += 1;
    }

    debug!("read {} of {} bytes at offset {}", copied, buf.len(), offset);
    Ok(copied)
}

/// Encrypt and write `data` at logical `offset`.
///
/// A write starting past the end of the file first fills the gap with
/// encrypted zeros.
pub fn write<F: BlockFile + ?Sized>(
    session: &Session,
    ctx: &mut CipherContext,
    file: &F,
    offset: u64,
    data: &[u8],
) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }

    let current = file.len().map_err(Error::ReadFailure)?;
    if offset > current {
        extend_to(session, ctx, file, offset)?;
    }

    write_blocks(session, ctx, file, offset, data)
}

/// Upper bound on a run of whole blocks ciphered and written in one call
const BATCH_BYTES: usize = 64 * 1024;

/// Largest multiple of `block_size` within `BATCH_BYTES`, at least one block
fn batch_len(block_size: usize) -> usize {
    (BATCH_BYTES / block_size).max(1) * block_size
}

fn write_blocks<F: BlockFile + ?Sized>(
    session: &Session,
    ctx: &mut CipherContext,
    file: &F,
    offset: u64,
    data: &[u8],
) -> Result<usize> {
    let block_size = session.block_size();
    let bs = block_size as u64;
    let end = offset + data.len() as u64;
    let mut position = offset;
    let mut block_buf = alloc_buffer(block_size)?;
    let mut batch = Vec::new();
    let mut written = 0;

    while position < end {
        let block_start = position - position % bs;
        let lo = (position - block_start) as usize;
        let hi = (end - block_start).min(bs) as usize;

        if lo == 0 && hi == block_size {
            // Consecutive whole blocks sit at consecutive keystream
            // positions, so a run is ciphered and written in one go
            let whole = (end - position) / bs * bs;
            let run = whole.min(batch_len(block_size) as u64) as usize;
            if batch.len() < run {
                batch = alloc_buffer(run)?;
            }

            let chunk = &mut batch[..run];
            chunk.copy_from_slice(&data[written..written + run]);
            ctx.encrypt_at(position, chunk);
            write_full(file, chunk, position).map_err(Error::WriteFailure)?;

            debug!("blocks {}..{} written", position / bs, (position + run as u64) / bs);
            written += run;
            position += run as u64;
            continue;
        }

        // Partial coverage needs the existing bytes of the block
        let existing = read_full(file, &mut block_buf, block_start).map_err(Error::ReadFailure)?;
        ctx.decrypt_at(block_start, &mut block_buf[..existing]);
        if existing < lo {
            block_buf[existing..lo].fill(0);
        }

        block_buf[lo..hi].copy_from_slice(&data[written..written + (hi - lo)]);

        let valid = existing.max(hi);
        ctx.encrypt_at(block_start, &mut block_buf[..valid]);
        write_full(file, &block_buf[..valid], block_start).map_err(Error::WriteFailure)?;

        debug!("block {} written ({} valid bytes)", block_start / bs, valid);
        written += hi - lo;
        position = block_start + hi as u64;
    }

    Ok(written)
}

/// Grow the file to `new_len` logical bytes of zeros
pub fn extend_to<F: BlockFile + ?Sized>(
    session: &Session,
    ctx: &mut CipherContext,
    file: &F,
    new_len: u64,
) -> Result<()> {
    let mut position = file.len().map_err(Error::ReadFailure)?;
    if new_len <= position {
        return Ok(());
    }

    let block_size = session.block_size() as u64;
    let zeros = alloc_buffer(batch_len(session.block_size()))?;
    while position < new_len {
        // Finish a partial last block first so later chunks stay aligned
        let step = match position % block_size {
            0 => zeros.len() as u64,
            used => block_size - used,
        };
        let chunk = step.min(new_len - position) as usize;
        write_blocks(session, ctx, file, position, &zeros[..chunk])?;
        position += chunk as u64;
    }

    Ok(())
}

/// Set the logical length of the file
pub fn resize<F: BlockFile + ?Sized>(
    session: &Session,
    ctx: &mut CipherContext,
    file: &F,
    size: u64,
) -> Result<()> {
    let current = file.len().map_err(Error::ReadFailure)?;
    if size <= current {
        // Every byte decrypts on its own, so cutting a block is enough
        file.set_len(size).map_err(Error::WriteFailure)
    } else {
        extend_to(session, ctx, file, size)
    }
}
