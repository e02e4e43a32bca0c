//! Operation implementations, one module per resource family
//!
//! Byte operations share the generic [`read`] and [`write`] drivers below:
//! they attempt the non-blocking call against the payload and park on the
//! reactor only when the call reports that it would block.

pub mod fs;
pub mod net;
pub mod process;
pub mod signal;
pub mod tls;
pub mod watch;

use crate::error::{ErrorKind, OpError, OpResult};
use crate::runtime::{Interest, Runtime};
use crate::table::{Handle, Payload};
use std::io;

/// Outcome of one non-blocking attempt
pub(crate) enum Step<T> {
    Done(T),
    Wait(Interest),
}

/// Turn `WouldBlock` into a wait on `interest`
pub(crate) fn nonblocking<T>(res: io::Result<T>, interest: Interest) -> OpResult<Step<T>> {
    match res {
        Ok(value) => Ok(Step::Done(value)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Step::Wait(interest)),
        Err(e) => Err(e.into()),
    }
}

/// Read up to `len` bytes. An empty result is end of stream.
pub(crate) async fn read(rt: &Runtime, rid: Handle, len: usize) -> OpResult<Vec<u8>> {
    if len == 0 {
        return Err(OpError::invalid_data("read length must be greater than zero"));
    }
    loop {
        let step = rt.with_payload(rid, |payload| match payload {
            Payload::File(f) => f.read(len).map(Step::Done),
            Payload::Socket(s) => nonblocking(s.read(len), Interest::READABLE),
            Payload::Pipe(p) => nonblocking(p.read(len), Interest::READABLE),
            Payload::TlsSocket(s) => s.read(len),
            other => Err(Runtime::wrong_kind(rid, other.kind(), "op_read")),
        })?;
        match step {
            Step::Done(bytes) => return Ok(bytes),
            Step::Wait(interest) => rt.readiness(rid, interest).await,
        }
    }
}

/// Write as much of `data` as the resource accepts in one go
pub(crate) async fn write(rt: &Runtime, rid: Handle, data: &[u8]) -> OpResult<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let mut zero_writes = WriteZeroGuard::new(rt.config().io.write_zero_retries);
    loop {
        let step = rt.with_payload(rid, |payload| match payload {
            Payload::File(f) => f.write(data).map(Step::Done),
            Payload::Socket(s) => nonblocking(s.write(data), Interest::WRITABLE),
            Payload::Pipe(p) => nonblocking(p.write(data), Interest::WRITABLE),
            Payload::TlsSocket(s) => s.write(data),
            other => Err(Runtime::wrong_kind(rid, other.kind(), "op_write")),
        })?;
        match step {
            Step::Done(0) => {
                zero_writes.record()?;
                rt.yield_now().await;
            }
            Step::Done(n) => return Ok(n),
            Step::Wait(interest) => rt.readiness(rid, interest).await,
        }
    }
}

/// Counts writes that made no progress
pub(crate) struct WriteZeroGuard {
    retries: u32,
    seen: u32,
}

impl WriteZeroGuard {
    pub(crate) fn new(retries: u32) -> Self {
        Self { retries, seen: 0 }
    }

    /// Record a zero-byte write, failing once the retries are used up
    pub(crate) fn record(&mut self) -> OpResult<()> {
        self.seen += 1;
        if self.seen > self.retries {
            Err(OpError::new(
                ErrorKind::WriteZero,
                format!("write returned 0 bytes {} times", self.seen),
            ))
        } else {
            Ok(())
        }
    }
}
