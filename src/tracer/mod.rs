pub mod event;
pub mod parse;
pub mod stats;

use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upper bound on a single framed record.
pub const MAX_RECORD_SIZE: usize = 64 * 1024;

/// Producer of raw, undecoded sample records.
pub trait SampleSource: Send {
    /// Read the next record into `buf`, replacing its contents.
    /// Resolves to `Ok(false)` at a clean end of stream.
    fn next_record<'a>(
        &'a mut self,
        buf: &'a mut Vec<u8>,
    ) -> impl Future<Output = Result<bool>> + Send + 'a;
}

/// Replays length-prefixed records (`len: u32 LE` then `len` bytes).
pub struct ReplaySource<R> {
    reader: BufReader<R>,
    records: u64,
}

/// Boxed reader used for files and stdin.
pub type DynReader = Box<dyn AsyncRead + Unpin + Send>;

impl ReplaySource<DynReader> {
    /// Open a replay file, or stdin when no path is given.
    pub async fn open(path: Option<&Path>) -> Result<Self> {
        let reader: DynReader = match path {
            Some(p) => Box::new(
                tokio::fs::File::open(p)
                    .await
                    .with_context(|| format!("opening sample input {}", p.display()))?,
            ),
            None => Box::new(tokio::io::stdin()),
        };
        Ok(Self::new(reader))
    }
}

impl<R: AsyncRead + Unpin + Send> ReplaySource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            records: 0,
        }
    }

    /// Number of records read so far.
    pub fn records(&self) -> u64 {
        self.records
    }
}

impl<R: AsyncRead + Unpin + Send> SampleSource for ReplaySource<R> {
    async fn next_record<'a>(&'a mut self, buf: &'a mut Vec<u8>) -> Result<bool> {
        let len = match self.reader.read_u32_le().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e).context("reading record length"),
        };

        if len > MAX_RECORD_SIZE {
            bail!("record {} declares {len} bytes, limit is {MAX_RECORD_SIZE}", self.records);
        }

        buf.clear();
        buf.resize(len, 0);
        self.reader
            .read_exact(buf)
            .await
            .with_context(|| format!("reading record {} ({len} bytes)", self.records))?;

        self.records += 1;
        Ok(true)
    }
}

/// Append `record` to `out` with its length prefix.
pub fn frame_record(out: &mut Vec<u8>, record: &[u8]) {
    out.extend_from_slice(&(record.len() as u32).to_le_bytes());
    out.extend_from_slice(record);
}

/// Drive a source on its own task, forwarding records over a channel.
///
/// Reading is not cancel-safe, so the session loop selects on the
/// channel instead of the source. The channel closes on end of input,
/// on a read error, or when `ctx` is cancelled.
pub fn spawn_reader<S>(
    mut source: S,
    capacity: usize,
    ctx: CancellationToken,
) -> mpsc::Receiver<Vec<u8>>
where
    S: SampleSource + 'static,
{
    let (tx, rx) = mpsc::channel(capacity);

    tokio::spawn(async move {
        loop {
            let mut buf = Vec::new();
            let read = tokio::select! {
                _ = ctx.cancelled() => break,
                read = source.next_record(&mut buf) => read,
            };

            match read {
                Ok(true) => {
                    if tx.send(buf).await.is_err() {
                        break;
                    }
                }
                Ok(false) => {
                    tracing::info!("end of sample input");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "sample input failed");
                    break;
                }
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replay_reads_framed_records() {
        let mut input = Vec::new();
        frame_record(&mut input, b"abc");
        frame_record(&mut input, b"");
        frame_record(&mut input, b"defg");

        let mut source = ReplaySource::new(input.as_slice());
        let mut buf = Vec::new();

        assert!(source.next_record(&mut buf).await.expect("first"));
        assert_eq!(buf, b"abc");
        assert!(source.next_record(&mut buf).await.expect("second"));
        assert!(buf.is_empty());
        assert!(source.next_record(&mut buf).await.expect("third"));
        assert_eq!(buf, b"defg");
        assert!(!source.next_record(&mut buf).await.expect("eof"));
        assert_eq!(source.records(), 3);
    }

    #[tokio::test]
    async fn test_replay_rejects_oversized_record() {
        let input = ((MAX_RECORD_SIZE + 1) as u32).to_le_bytes();
        let mut source = ReplaySource::new(&input[..]);
        let mut buf = Vec::new();
        assert!(source.next_record(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_replay_truncated_body_is_an_error() {
        let mut input = Vec::new();
        input.extend_from_slice(&8u32.to_le_bytes());
        input.extend_from_slice(b"1234");
        let mut source = ReplaySource::new(input.as_slice());
        let mut buf = Vec::new();
        assert!(source.next_record(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_reader_forwards_until_eof() {
        let mut input = Vec::new();
        frame_record(&mut input, b"one");
        frame_record(&mut input, b"two");

        let source = ReplaySource::new(std::io::Cursor::new(input));
        let mut rx = spawn_reader(source, 4, CancellationToken::new());

        assert_eq!(rx.recv().await.as_deref(), Some(&b"one"[..]));
        assert_eq!(rx.recv().await.as_deref(), Some(&b"two"[..]));
        assert_eq!(rx.recv().await, None);
    }
}
