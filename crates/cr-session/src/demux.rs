//! Marker-delimited frame extraction.
//!
//! The transcoder writes an endless MJPEG byte stream with no framing of its
//! own. [`FrameDemuxer`] accumulates chunks and cuts out every region that
//! starts with the start marker and ends with the next end marker, inclusive.
//! Anything before the earliest possible start marker is discarded as soon as
//! it is seen, so the buffer only ever holds a partial frame.

use bytes::{Buf, Bytes, BytesMut};
use cr_core::{Error, Result};
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

/// JPEG start-of-image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// One extracted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Zero-based position in the session's frame sequence.
    pub sequence: u64,
    /// Frame bytes including both markers.
    pub data: Bytes,
}

/// Incremental splitter for marker-delimited frames.
#[derive(Debug)]
pub struct FrameDemuxer {
    start: Vec<u8>,
    end: Vec<u8>,
    buf: BytesMut,
    max_buffer: usize,
    next_sequence: u64,
    /// Bytes after the pending start marker already searched for an end marker.
    scanned: usize,
}

impl FrameDemuxer {
    /// Create a demuxer for the given marker pair. Empty markers fall back to
    /// the JPEG pair.
    pub fn new(start: Vec<u8>, end: Vec<u8>, max_buffer: usize) -> Self {
        let (start, end) = if start.is_empty() || end.is_empty() {
            (JPEG_SOI.to_vec(), JPEG_EOI.to_vec())
        } else {
            (start, end)
        };
        Self {
            start,
            end,
            buf: BytesMut::new(),
            max_buffer,
            next_sequence: 0,
            scanned: 0,
        }
    }

    /// A demuxer for JPEG frames.
    pub fn jpeg(max_buffer: usize) -> Self {
        Self::new(JPEG_SOI.to_vec(), JPEG_EOI.to_vec(), max_buffer)
    }

    /// Append `chunk` and return every frame it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start_at) = find(&self.buf, &self.start) else {
                // Keep only a tail that could still begin a start marker.
                let keep = (self.start.len() - 1).min(self.buf.len());
                let discard = self.buf.len() - keep;
                self.buf.advance(discard);
                self.scanned = 0;
                break;
            };
            if start_at > 0 {
                self.buf.advance(start_at);
                self.scanned = 0;
            }

            // Resume where the last push stopped, backing up far enough to
            // catch an end marker split across chunks.
            let body = &self.buf[self.start.len()..];
            let from = self.scanned.saturating_sub(self.end.len() - 1);
            let Some(end_at) = find(&body[from..], &self.end).map(|at| at + from) else {
                self.scanned = body.len();
                break;
            };

            let frame_len = self.start.len() + end_at + self.end.len();
            let data = self.buf.split_to(frame_len).freeze();
            frames.push(Frame {
                sequence: self.next_sequence,
                data,
            });
            self.next_sequence += 1;
            self.scanned = 0;
        }

        frames
    }

    /// Fail if the pending partial frame has outgrown the buffer bound.
    pub fn check_bound(&self) -> Result<()> {
        if self.buf.len() > self.max_buffer {
            return Err(Error::BufferOverflow {
                limit: self.max_buffer,
            });
        }
        Ok(())
    }

    /// Bytes currently held for an incomplete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Number of frames emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next_sequence
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read `reader` in `chunk_size` pieces and yield frames until end of input.
///
/// The stream ends with an error if a read fails or the demuxer's buffer
/// bound is exceeded.
pub fn frame_stream<R>(
    mut reader: R,
    mut demuxer: FrameDemuxer,
    chunk_size: usize,
) -> impl Stream<Item = Result<Frame>>
where
    R: AsyncRead + Unpin,
{
    async_stream::try_stream! {
        let mut chunk = vec![0u8; chunk_size.max(1)];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            for frame in demuxer.push(&chunk[..n]) {
                yield frame;
            }
            demuxer.check_bound()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = JPEG_SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&JPEG_EOI);
        v
    }

    #[test]
    fn single_frame_in_one_chunk() {
        let mut d = FrameDemuxer::jpeg(1024);
        let frames = d.push(&jpeg(b"abc"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(&frames[0].data[..], &jpeg(b"abc")[..]);
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut d = FrameDemuxer::jpeg(1024);
        let mut input = jpeg(b"one");
        input.extend(jpeg(b"two"));
        input.extend(jpeg(b"three"));
        let frames = d.push(&input);
        let seqs: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(&frames[2].data[..], &jpeg(b"three")[..]);
    }

    #[test]
    fn frames_split_at_every_offset() {
        let mut input = b"junk".to_vec();
        let expected: Vec<Vec<u8>> = (0..4u8).map(|i| jpeg(&[i; 7])).collect();
        for f in &expected {
            input.extend_from_slice(f);
            input.extend_from_slice(b"\x00\x01");
        }

        for chunk_size in 1..=input.len() {
            let mut d = FrameDemuxer::jpeg(1024);
            let frames: Vec<Frame> = input.chunks(chunk_size).flat_map(|c| d.push(c)).collect();
            let got: Vec<Vec<u8>> = frames.iter().map(|f| f.data.to_vec()).collect();
            assert_eq!(got, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn marker_split_across_chunks() {
        let mut d = FrameDemuxer::jpeg(1024);
        assert!(d.push(&[0xFF]).is_empty());
        assert!(d.push(&[0xD8, b'x', 0xFF]).is_empty());
        let frames = d.push(&[0xD9]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].data[..], &[0xFF, 0xD8, b'x', 0xFF, 0xD9]);
    }

    #[test]
    fn large_frame_in_small_chunks() {
        let body: Vec<u8> = (0..5000u32).map(|i| (i % 200) as u8).collect();
        let frame = jpeg(&body);
        let mut d = FrameDemuxer::jpeg(8192);

        let mut frames = Vec::new();
        for chunk in frame.chunks(3) {
            frames.extend(d.push(chunk));
            if frames.is_empty() {
                assert_eq!(d.scanned + JPEG_SOI.len(), d.buffered());
            }
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].data[..], &frame[..]);
        assert_eq!(d.scanned, 0);

        let frames = d.push(&jpeg(b"next"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sequence, 1);
    }

    #[test]
    fn end_marker_before_start_is_skipped() {
        let mut d = FrameDemuxer::jpeg(1024);
        let mut input = JPEG_EOI.to_vec();
        input.extend(jpeg(b"ok"));
        let frames = d.push(&input);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].data[..], &jpeg(b"ok")[..]);
    }

    #[test]
    fn garbage_is_not_retained() {
        let mut d = FrameDemuxer::jpeg(16);
        for _ in 0..100 {
            assert!(d.push(&[0x00; 64]).is_empty());
            assert!(d.buffered() <= 1);
            d.check_bound().unwrap();
        }
    }

    #[test]
    fn unterminated_frame_overflows() {
        let mut d = FrameDemuxer::jpeg(16);
        d.push(&JPEG_SOI);
        d.push(&[0x11; 32]);
        assert!(matches!(
            d.check_bound(),
            Err(Error::BufferOverflow { limit: 16 })
        ));
    }

    #[test]
    fn custom_markers() {
        let mut d = FrameDemuxer::new(b"<f>".to_vec(), b"</f>".to_vec(), 1024);
        let frames = d.push(b"..<f>hello</f>..<f>bye</f>");
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[1].data[..], b"<f>bye</f>");
        assert_eq!(d.emitted(), 2);
    }

    #[tokio::test]
    async fn stream_yields_frames_until_eof() {
        let mut input = Vec::new();
        for i in 0..5u8 {
            input.extend(jpeg(&[i; 100]));
        }
        let stream = frame_stream(&input[..], FrameDemuxer::jpeg(4096), 7);
        let frames: Vec<Frame> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[4].sequence, 4);
        assert_eq!(&frames[4].data[..], &jpeg(&[4; 100])[..]);
    }

    #[tokio::test]
    async fn stream_with_no_markers_is_empty() {
        let input = vec![0x42u8; 10_000];
        let stream = frame_stream(&input[..], FrameDemuxer::jpeg(4096), 4096);
        let frames: Vec<Result<Frame>> = stream.collect().await;
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn stream_reports_overflow() {
        let mut input = JPEG_SOI.to_vec();
        input.extend(vec![0x42u8; 10_000]);
        let stream = frame_stream(&input[..], FrameDemuxer::jpeg(1024), 512);
        let results: Vec<Result<Frame>> = stream.collect().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::BufferOverflow { .. })));
    }
}
