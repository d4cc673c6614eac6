//! Stream and pipe engine: byte chunking, line iteration, cross-handle
//! piping and fan-out tee (spec.md §4.7).
//!
//! Adapters deliver stdout/stderr as a [`ChunkStream`] of arbitrary-sized
//! byte chunks; this module buffers them into lines and wires them to
//! sinks without ever holding more than one line plus one chunk, matching
//! the "no unbounded intermediate buffer" invariant.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::CrossExecError;

/// Default cap on a single buffered line before `StreamError::LineTooLong`.
pub const DEFAULT_MAX_LINE_LEN: usize = 1024 * 1024;

/// Producer handle for a [`ChunkStream`]; adapters hold the sender side.
pub type ChunkSender = mpsc::Sender<Bytes>;

/// Consumer handle over an adapter's raw byte chunks.
pub struct ChunkStream {
    rx: mpsc::Receiver<Bytes>,
}

impl ChunkStream {
    pub fn new(capacity: usize) -> (ChunkSender, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }

    pub fn from_receiver(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Pull the next chunk, or `None` on EOF (sender dropped).
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Line separator policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSeparator {
    Lf,
    CrLf,
}

pub struct LineReaderOptions {
    pub separator: LineSeparator,
    pub max_line_len: usize,
}

impl Default for LineReaderOptions {
    fn default() -> Self {
        Self {
            separator: LineSeparator::Lf,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// Buffers chunks across reads and yields one line at a time. A line is a
/// maximal byte sequence terminated by the configured separator or EOF; no
/// trailing empty line is yielded for input ending in exactly one
/// terminator (invariant 11).
pub struct LineReader {
    stream: ChunkStream,
    buf: Vec<u8>,
    opts: LineReaderOptions,
    eof: bool,
}

impl LineReader {
    pub fn new(stream: ChunkStream, opts: LineReaderOptions) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            opts,
            eof: false,
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let needle = b'\n';
        if let Some(pos) = self.buf.iter().position(|&b| b == needle) {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // drop \n
            if self.opts.separator == LineSeparator::CrLf && line.last() == Some(&b'\r') {
                line.pop();
            }
            return Some(line);
        }
        None
    }

    /// Returns `Ok(Some(line))`, `Ok(None)` at end of stream, or
    /// `Err(StreamError::LineTooLong)`.
    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>, CrossExecError> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if self.buf.len() > self.opts.max_line_len {
                return Err(CrossExecError::StreamError {
                    message: format!(
                        "line exceeded max length of {} bytes",
                        self.opts.max_line_len
                    ),
                    context: Default::default(),
                });
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.buf);
                self.eof = true; // stays true; next call yields None
                return Ok(Some(line));
            }
            match self.stream.next_chunk().await {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => self.eof = true,
            }
        }
    }
}

/// Copies chunks from `stream` into an async writer until EOF.
pub async fn pipe_to_writer<W>(mut stream: ChunkStream, mut writer: W) -> Result<u64, CrossExecError>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    while let Some(chunk) = stream.next_chunk().await {
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| CrossExecError::StreamError {
                message: format!("pipe write failed: {e}"),
                context: Default::default(),
            })?;
        total += chunk.len() as u64;
    }
    writer
        .flush()
        .await
        .map_err(|e| CrossExecError::StreamError {
            message: format!("pipe flush failed: {e}"),
            context: Default::default(),
        })?;
    Ok(total)
}

/// Delivers each line to `callback` sequentially. Returning `false` from the
/// callback requests a stop; the caller is responsible for signaling the
/// upstream producer (e.g. sending the configured kill signal).
pub async fn pipe_to_line_callback<F>(
    stream: ChunkStream,
    opts: LineReaderOptions,
    mut callback: F,
) -> Result<(), CrossExecError>
where
    F: FnMut(Vec<u8>) -> bool,
{
    let mut reader = LineReader::new(stream, opts);
    while let Some(line) = reader.next_line().await? {
        if !callback(line) {
            break;
        }
    }
    Ok(())
}

/// Fans out each chunk of `stream` to every sink. A slow sink applies
/// backpressure to the source because `mpsc::Sender::send` awaits capacity.
pub async fn tee(mut stream: ChunkStream, sinks: Vec<ChunkSender>) -> Result<(), CrossExecError> {
    while let Some(chunk) = stream.next_chunk().await {
        for sink in &sinks {
            if sink.send(chunk.clone()).await.is_err() {
                // A dropped sink is not fatal to the others.
                continue;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn line_reader_yields_lines_without_trailing_empty() {
        let (tx, rx) = ChunkStream::new(8);
        tx.send(Bytes::from_static(b"one\ntwo\nthree\n")).await.unwrap();
        drop(tx);

        let mut reader = LineReader::new(rx, LineReaderOptions::default());
        assert_eq!(reader.next_line().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(reader.next_line().await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(reader.next_line().await.unwrap(), Some(b"three".to_vec()));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn line_reader_handles_chunk_boundaries_mid_line() {
        let (tx, rx) = ChunkStream::new(8);
        tx.send(Bytes::from_static(b"hel")).await.unwrap();
        tx.send(Bytes::from_static(b"lo\n")).await.unwrap();
        drop(tx);

        let mut reader = LineReader::new(rx, LineReaderOptions::default());
        assert_eq!(reader.next_line().await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn line_reader_strips_cr_in_crlf_mode() {
        let (tx, rx) = ChunkStream::new(8);
        tx.send(Bytes::from_static(b"one\r\ntwo\r\n")).await.unwrap();
        drop(tx);

        let opts = LineReaderOptions {
            separator: LineSeparator::CrLf,
            ..Default::default()
        };
        let mut reader = LineReader::new(rx, opts);
        assert_eq!(reader.next_line().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(reader.next_line().await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn line_too_long_errors() {
        let (tx, rx) = ChunkStream::new(8);
        tx.send(Bytes::from(vec![b'a'; 10])).await.unwrap();
        drop(tx);

        let opts = LineReaderOptions {
            separator: LineSeparator::Lf,
            max_line_len: 4,
        };
        let mut reader = LineReader::new(rx, opts);
        let err = reader.next_line().await.unwrap_err();
        assert!(matches!(err, CrossExecError::StreamError { .. }));
    }

    #[tokio::test]
    async fn pipe_to_writer_copies_all_bytes() {
        let (tx, rx) = ChunkStream::new(8);
        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        let total = pipe_to_writer(rx, &mut out).await.unwrap();
        assert_eq!(total, 11);
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn line_callback_can_request_stop() {
        let (tx, rx) = ChunkStream::new(8);
        tx.send(Bytes::from_static(b"a\nb\nc\n")).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        pipe_to_line_callback(rx, LineReaderOptions::default(), |line| {
            seen.push(line);
            seen.len() < 2
        })
        .await
        .unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn tee_fans_out_to_all_sinks() {
        let (tx, rx) = ChunkStream::new(8);
        let (s1_tx, mut s1_rx) = mpsc::channel(8);
        let (s2_tx, mut s2_rx) = mpsc::channel(8);

        tx.send(Bytes::from_static(b"data")).await.unwrap();
        drop(tx);

        tee(rx, vec![s1_tx, s2_tx]).await.unwrap();

        assert_eq!(s1_rx.recv().await.unwrap(), Bytes::from_static(b"data"));
        assert_eq!(s2_rx.recv().await.unwrap(), Bytes::from_static(b"data"));
    }
}
