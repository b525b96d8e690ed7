//! Output demultiplexing
//!
//! Both strategies funnel program output into one channel of
//! [`OutputChunk`]s tagged by origin stream. The container strategy splits
//! the runtime's multiplexed exec stream; the local strategy reads the two
//! pipes separately. Either way chunks of one stream keep their order.

use bollard::container::LogOutput;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::{OutputChunk, StreamKind};

const READ_BUFFER_LEN: usize = 8 * 1024;

/// Map one frame of the runtime's multiplexed stream to its origin
pub fn split_frame(frame: LogOutput) -> Option<OutputChunk> {
    match frame {
        LogOutput::StdOut { message } => Some(OutputChunk::new(StreamKind::Stdout, message.to_vec())),
        LogOutput::StdErr { message } => Some(OutputChunk::new(StreamKind::Stderr, message.to_vec())),
        // TTY-less execs never produce console frames, but treat them as stdout if they do
        LogOutput::Console { message } => {
            Some(OutputChunk::new(StreamKind::Stdout, message.to_vec()))
        }
        LogOutput::StdIn { .. } => None,
    }
}

/// Forward a multiplexed exec stream until it ends or the receiver goes away
pub async fn forward_frames<S>(mut frames: S, tx: mpsc::Sender<OutputChunk>)
where
    S: Stream<Item = Result<LogOutput, bollard::errors::Error>> + Unpin,
{
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(frame) => {
                if let Some(chunk) = split_frame(frame) {
                    if tx.send(chunk).await.is_err() {
                        debug!("Output receiver dropped, stopping exec stream");
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("Error reading exec output: {}", e);
                break;
            }
        }
    }
}

/// Forward one pipe of a local process
pub async fn forward_reader<R>(mut reader: R, stream: StreamKind, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_LEN];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(OutputChunk::new(stream, &buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Error reading {}: {}", stream, e);
                break;
            }
        }
    }
}

/// Incremental UTF-8 decoder for one stream.
///
/// Holds back an incomplete trailing sequence until the next chunk arrives,
/// so characters split across chunks are not replaced.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `bytes` (plus held-back bytes) as possible
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is held back, lossily
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(s: &str) -> LogOutput {
        LogOutput::StdOut {
            message: s.as_bytes().to_vec().into(),
        }
    }

    fn err(s: &str) -> LogOutput {
        LogOutput::StdErr {
            message: s.as_bytes().to_vec().into(),
        }
    }

    #[tokio::test]
    async fn test_demux_preserves_per_stream_order() {
        let frames = vec![
            Ok(out("out-1\n")),
            Ok(err("err-1\n")),
            Ok(out("out-2\n")),
            Ok(LogOutput::StdIn {
                message: Vec::new().into(),
            }),
            Ok(err("err-2\n")),
            Ok(out("out-3\n")),
        ];
        let (tx, mut rx) = mpsc::channel(16);
        forward_frames(futures::stream::iter(frames), tx).await;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = rx.recv().await {
            let text = String::from_utf8(chunk.data).unwrap();
            match chunk.stream {
                StreamKind::Stdout => stdout.push(text),
                StreamKind::Stderr => stderr.push(text),
            }
        }
        assert_eq!(stdout, vec!["out-1\n", "out-2\n", "out-3\n"]);
        assert_eq!(stderr, vec!["err-1\n", "err-2\n"]);
    }

    #[tokio::test]
    async fn test_forward_reader_tags_stream() {
        let (tx, mut rx) = mpsc::channel(4);
        forward_reader(&b"hello"[..], StreamKind::Stderr, tx).await;
        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.stream, StreamKind::Stderr);
        assert_eq!(chunk.data, b"hello");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_decoder_joins_split_characters() {
        let text = "héllo ✓";
        let bytes = text.as_bytes();
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        for byte in bytes {
            out.push_str(&decoder.push(std::slice::from_ref(byte)));
        }
        out.push_str(&decoder.finish());
        assert_eq!(out, text);
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(b"a\xffb"), "a\u{FFFD}b");
        assert_eq!(decoder.push(b"\xe2\x9c"), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
