//! Line-delimited JSON request feed.
//!
//! Each input line is `{"data": "<base64>", "public_key": "<base64>"}`.
//! Every non-blank line gets exactly one JSON response line, in order.
//! Lines that cannot be decoded or exceed [`MAX_LINE_BYTES`] are rejected
//! here and never reach the vault core.

use std::io;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::supervisor::{ExecuteOutcome, VaultRequest};

#[derive(Debug, Deserialize)]
struct IngressRequest {
    data: String,
    public_key: String,
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngressResponse {
    /// Transformed payload and its audit reference.
    Success {
        /// Base64-encoded ciphertext.
        payload: String,
        /// Audit reference.
        audit_ref: String,
    },
    /// Node could not serve the request.
    Unavailable,
    /// The line was not a valid request.
    Rejected {
        /// Why the line was rejected.
        reason: String,
    },
}

impl From<ExecuteOutcome> for IngressResponse {
    fn from(outcome: ExecuteOutcome) -> Self {
        match outcome {
            ExecuteOutcome::Success(output) => Self::Success {
                payload: STANDARD.encode(&output.ciphertext),
                audit_ref: output.audit_ref,
            },
            ExecuteOutcome::Unavailable => Self::Unavailable,
        }
    }
}

/// Decode one request line into `(data, public_key)`.
///
/// # Errors
///
/// Returns a reason string for malformed JSON or invalid base64.
pub fn decode_request(line: &str) -> Result<(Vec<u8>, Vec<u8>), String> {
    let request: IngressRequest =
        serde_json::from_str(line).map_err(|e| format!("malformed request: {e}"))?;
    let data = STANDARD
        .decode(request.data.as_bytes())
        .map_err(|e| format!("invalid base64 in data: {e}"))?;
    let public_key = STANDARD
        .decode(request.public_key.as_bytes())
        .map_err(|e| format!("invalid base64 in public_key: {e}"))?;
    Ok((data, public_key))
}

/// Longest request line accepted, newline excluded.
pub const MAX_LINE_BYTES: usize = 1_048_576;

enum RawLine {
    Complete,
    Oversized,
    Eof,
}

/// Read one `\n`-terminated line into `buf` without holding more than
/// `max_len` bytes of it. The rest of an oversized line is skipped.
async fn read_raw_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_len: usize,
) -> io::Result<RawLine>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut oversized = false;
    let mut read_any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (read_any, oversized) {
                (false, _) => RawLine::Eof,
                (true, true) => RawLine::Oversized,
                (true, false) => RawLine::Complete,
            });
        }
        read_any = true;

        let newline = available.iter().position(|&b| b == b'\n');
        let chunk = match newline {
            Some(pos) => &available[..pos],
            None => available,
        };
        if !oversized {
            if buf.len().saturating_add(chunk.len()) > max_len {
                oversized = true;
                buf.clear();
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        let used = match newline {
            Some(pos) => pos.saturating_add(1),
            None => chunk.len(),
        };
        reader.consume(used);

        if newline.is_some() {
            return Ok(if oversized {
                RawLine::Oversized
            } else {
                RawLine::Complete
            });
        }
    }
}

/// Serve requests from `reader` until EOF, writing responses to `writer`.
///
/// Lines that are not UTF-8 or longer than [`MAX_LINE_BYTES`] are rejected
/// and reading continues. Returns early when the supervisor stops accepting
/// requests.
///
/// # Errors
///
/// Returns an error if reading input or writing a response fails.
pub async fn serve<R, W>(
    mut reader: R,
    mut writer: W,
    requests: mpsc::Sender<VaultRequest>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let response = match read_raw_line(&mut reader, &mut buf, MAX_LINE_BYTES).await? {
            RawLine::Eof => break,
            RawLine::Oversized => reject(format!("request line exceeds {MAX_LINE_BYTES} bytes")),
            RawLine::Complete => match std::str::from_utf8(&buf) {
                Err(e) => reject(format!("request line is not valid UTF-8: {e}")),
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => match decode_request(line) {
                    Err(reason) => reject(reason),
                    Ok((data, public_key)) => {
                        let (reply_tx, reply_rx) = oneshot::channel();
                        let request = VaultRequest {
                            data,
                            public_key,
                            reply: reply_tx,
                        };
                        if requests.send(request).await.is_err() {
                            debug!("supervisor no longer accepting requests");
                            return Ok(());
                        }
                        match reply_rx.await {
                            Ok(outcome) => IngressResponse::from(outcome),
                            Err(_) => IngressResponse::Unavailable,
                        }
                    }
                },
            },
        };

        write_response(&mut writer, &response).await?;
    }

    debug!("ingress reached end of input");
    Ok(())
}

fn reject(reason: String) -> IngressResponse {
    warn!(reason = %reason, "rejecting ingress line");
    IngressResponse::Rejected { reason }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &IngressResponse,
) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
