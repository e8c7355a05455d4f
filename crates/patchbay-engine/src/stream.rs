//! Byte streams and chunk arithmetic for resource transfers.

use crate::error::OverlayError;
use bytes::Bytes;
use std::ops::Range;
use tokio::sync::mpsc;

/// A lazy, in-order sequence of byte chunks.
///
/// Chunks arrive in publish order; the stream ends when the sender side
/// closes it, or yields one final `Err` when the transfer failed or timed
/// out.
pub struct ByteStream {
    rx: mpsc::UnboundedReceiver<Result<Bytes, OverlayError>>,
}

impl ByteStream {
    /// Create a connected writer/stream pair.
    ///
    /// Useful for feeding a [`crate::Push`] or a provisioner reply from
    /// application code; dropping the writer ends the stream.
    #[must_use]
    pub fn pipe() -> (StreamWriter, ByteStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamWriter { tx }, ByteStream { rx })
    }

    /// Next chunk, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<Bytes, OverlayError>> {
        self.rx.recv().await
    }

    /// Drain the stream into one contiguous buffer.
    ///
    /// # Errors
    ///
    /// Returns the first stream error encountered.
    pub async fn collect(mut self) -> Result<Vec<u8>, OverlayError> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.extend_from_slice(&item?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ByteStream")
    }
}

/// Feeding end of a [`ByteStream`].
#[derive(Clone)]
pub struct StreamWriter {
    tx: mpsc::UnboundedSender<Result<Bytes, OverlayError>>,
}

impl StreamWriter {
    /// Append a chunk. Returns `false` once the reader is gone.
    pub fn write(&self, chunk: impl Into<Bytes>) -> bool {
        self.tx.send(Ok(chunk.into())).is_ok()
    }

    /// Terminate the stream with an application failure.
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.tx.send(Err(OverlayError::Resource(message.into())));
    }

    pub(crate) fn send_err(&self, error: OverlayError) {
        let _ = self.tx.send(Err(error));
    }
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamWriter")
    }
}

/// The data source of a push or a provisioner reply.
#[derive(Debug)]
pub enum ByteSource {
    /// A ready-made contiguous buffer
    Buffer(Vec<u8>),
    /// A lazy stream of chunks
    Stream(ByteStream),
}

impl From<Vec<u8>> for ByteSource {
    fn from(data: Vec<u8>) -> Self {
        ByteSource::Buffer(data)
    }
}

impl From<&[u8]> for ByteSource {
    fn from(data: &[u8]) -> Self {
        ByteSource::Buffer(data.to_vec())
    }
}

impl From<Bytes> for ByteSource {
    fn from(data: Bytes) -> Self {
        ByteSource::Buffer(data.to_vec())
    }
}

impl From<ByteStream> for ByteSource {
    fn from(stream: ByteStream) -> Self {
        ByteSource::Stream(stream)
    }
}

/// Byte ranges covering `len` bytes in slices of at most `chunk_size`.
///
/// Empty input yields no spans; the caller emits the single empty final
/// chunk itself.
pub(crate) fn chunk_spans(len: usize, chunk_size: usize) -> Vec<Range<usize>> {
    let size = chunk_size.max(1);
    let mut spans = Vec::with_capacity(len.div_ceil(size));
    let mut start = 0;
    while start < len {
        let end = (start + size).min(len);
        spans.push(start..end);
        start = end;
    }
    spans
}

/// Re-slice one stream read so no piece exceeds `chunk_size`.
pub(crate) fn split_chunk(bytes: Bytes, chunk_size: usize) -> Vec<Bytes> {
    if bytes.is_empty() {
        return Vec::new();
    }
    if bytes.len() <= chunk_size {
        return vec![bytes];
    }
    chunk_spans(bytes.len(), chunk_size)
        .into_iter()
        .map(|span| bytes.slice(span))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_cover_exact_multiple() {
        let spans = chunk_spans(90, 30);
        assert_eq!(spans, vec![0..30, 30..60, 60..90]);
    }

    #[test]
    fn spans_cover_remainder() {
        let spans = chunk_spans(100, 30);
        assert_eq!(spans.len(), 4);
        assert_eq!(spans[3], 90..100);
    }

    #[test]
    fn spans_empty_input() {
        assert!(chunk_spans(0, 30).is_empty());
    }

    #[test]
    fn spans_guard_zero_chunk_size() {
        assert_eq!(chunk_spans(3, 0).len(), 3);
    }

    #[test]
    fn split_chunk_reslices_large_reads() {
        let data = Bytes::from(vec![7u8; 10]);
        let pieces = split_chunk(data, 4);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].len(), 4);
        assert_eq!(pieces[2].len(), 2);
    }

    #[test]
    fn split_chunk_passes_small_reads_through() {
        let data = Bytes::from_static(b"ok");
        assert_eq!(split_chunk(data.clone(), 10), vec![data]);
    }

    #[tokio::test]
    async fn stream_collects_in_order() {
        let (writer, stream) = ByteStream::pipe();
        assert!(writer.write(Bytes::from_static(b"ab")));
        assert!(writer.write(Bytes::from_static(b"cd")));
        drop(writer);
        assert_eq!(stream.collect().await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn stream_surfaces_failure() {
        let (writer, stream) = ByteStream::pipe();
        writer.write(Bytes::from_static(b"ab"));
        writer.fail("broken");
        drop(writer);
        let err = stream.collect().await.unwrap_err();
        assert!(matches!(err, OverlayError::Resource(m) if m == "broken"));
    }
}
