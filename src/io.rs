//! Convenience loops over `op_read` and `op_write`

use crate::dispatch::{Op, OpValue};
use crate::error::{ErrorKind, OpError, OpResult};
use crate::runtime::Runtime;
use crate::table::Handle;

/// Chunk size used by [`read_to_end`]
pub const READ_CHUNK: usize = 16 * 1024;

/// Write all of `data`, issuing as many `op_write`s as it takes
pub async fn write_all(rt: &Runtime, rid: Handle, data: &[u8]) -> OpResult<()> {
    let mut offset = 0;
    while offset < data.len() {
        let written = rt
            .dispatch_async(
                Op::Write {
                    rid,
                    data: data[offset..].to_vec(),
                },
                None,
            )
            .await
            .and_then(OpValue::into_count)?;
        if written == 0 {
            return Err(OpError::new(ErrorKind::WriteZero, "failed to write whole buffer"));
        }
        offset += written;
    }
    Ok(())
}

/// Read until end of stream
pub async fn read_to_end(rt: &Runtime, rid: Handle) -> OpResult<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let chunk = rt
            .dispatch_async(Op::Read { rid, len: READ_CHUNK }, None)
            .await
            .and_then(OpValue::into_bytes)?;
        if chunk.is_empty() {
            return Ok(out);
        }
        out.extend_from_slice(&chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::fs::OpenOptions;
    use std::io::SeekFrom;

    #[test]
    fn test_file_write_all_then_read_to_end() {
        let dir = std::env::temp_dir().join(format!("resio-io-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("data.bin");

        let rt = Runtime::new().unwrap();
        let rid = rt
            .dispatch_sync(Op::OpenSync {
                path: path.clone(),
                options: OpenOptions::new().read(true).write(true).create(true).truncate(true),
            })
            .and_then(OpValue::into_handle)
            .unwrap();

        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let read_back = rt.block_on(async {
            write_all(&rt, rid, &payload).await?;
            rt.dispatch_sync(Op::Seek {
                rid,
                from: SeekFrom::Start(0),
            })?;
            read_to_end(&rt, rid).await
        });
        assert_eq!(read_back.unwrap(), payload);

        rt.close(rid).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
