//! Bounded line capture for subprocess stdout/stderr.
//!
//! A single JSON line exceeding the cap (10 MiB by default) is skipped
//! rather than buffered without bound; skipping is logged as a warning
//! and capture continues with the next line.

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::warn;

pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Read `reader` line-by-line, capping any single line at `cap` bytes.
/// Lines within the cap are appended verbatim (newline terminator
/// included when present in the source) to the returned buffer; oversized
/// lines are dropped with a warning. Returns the captured text and
/// whether any line was dropped.
pub async fn capture_capped<R: AsyncRead + Unpin>(reader: R, cap: usize, stream_label: &str) -> (String, bool) {
    let mut reader = BufReader::new(reader);
    let mut out = Vec::new();
    let mut dropped = false;

    loop {
        let mut buf = Vec::new();
        match read_until_capped(&mut reader, cap, &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.len() > cap {
                    warn!(stream = stream_label, len = buf.len(), cap, "skipping oversized line");
                    dropped = true;
                } else {
                    out.extend_from_slice(&buf);
                }
            }
            Err(e) => {
                warn!(stream = stream_label, error = %e, "error reading stream, stopping capture");
                break;
            }
        }
    }

    (String::from_utf8_lossy(&out).into_owned(), dropped)
}

/// Like `AsyncBufReadExt::read_until` but keeps reading (and counting
/// bytes) past `cap` until the delimiter or EOF, so an oversized line is
/// fully drained from the stream rather than desynchronizing the next
/// read. `buf` only ever holds up to `cap + 1` bytes; the caller checks
/// `buf.len() > cap` to detect truncation.
async fn read_until_capped<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    cap: usize,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    let mut total = 0usize;
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Ok(total);
        }
        total += 1;
        if buf.len() <= cap {
            buf.push(byte[0]);
        }
        if byte[0] == b'\n' {
            return Ok(total);
        }
    }
}
