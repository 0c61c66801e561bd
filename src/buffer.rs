use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// Which producer a sample came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

/// One decoded image handed over by the frame processor
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Presentation timestamp in nanoseconds on the producer clock
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    /// Packed BGRA pixels
    pub data: Bytes,
}

/// Interleaved 16-bit PCM
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub timestamp_ns: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub enum MediaSample {
    Video(VideoFrame),
    Audio(AudioBuffer),
}

impl MediaSample {
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            MediaSample::Video(frame) => frame.timestamp_ns,
            MediaSample::Audio(buffer) => buffer.timestamp_ns,
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            MediaSample::Video(_) => MediaKind::Video,
            MediaSample::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            MediaSample::Video(frame) => &frame.data,
            MediaSample::Audio(buffer) => &buffer.data,
        }
    }

    pub fn len(&self) -> usize {
        self.payload().len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }
}

#[derive(Default)]
struct SinkCounters {
    submitted: AtomicU64,
    dropped_full: AtomicU64,
    dropped_closed: AtomicU64,
    bytes: AtomicU64,
}

/// Snapshot of producer-side statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub submitted: u64,
    pub dropped_full: u64,
    pub dropped_closed: u64,
    pub bytes: u64,
}

/// Producer handle into the recorder's bounded sample queue.
///
/// Safe to clone into any number of capture threads. Submission never
/// blocks: when the queue is full the sample is dropped and counted.
#[derive(Clone)]
pub struct SampleSink {
    tx: mpsc::Sender<MediaSample>,
    counters: Arc<SinkCounters>,
}

/// Create a bounded sample queue
pub fn sample_channel(capacity: usize) -> (SampleSink, mpsc::Receiver<MediaSample>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        SampleSink {
            tx,
            counters: Arc::new(SinkCounters::default()),
        },
        rx,
    )
}

impl SampleSink {
    pub fn submit_video(&self, frame: VideoFrame) -> bool {
        self.submit(MediaSample::Video(frame))
    }

    pub fn submit_audio(&self, buffer: AudioBuffer) -> bool {
        self.submit(MediaSample::Audio(buffer))
    }

    /// Returns `false` if the sample was dropped
    pub fn submit(&self, sample: MediaSample) -> bool {
        let size = sample.len() as u64;
        match self.tx.try_send(sample) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes.fetch_add(size, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(sample)) => {
                self.counters.dropped_full.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "Sample queue full, dropping {:?} sample at {}",
                    sample.kind(),
                    sample.timestamp_ns()
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped_closed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped_full: self.counters.dropped_full.load(Ordering::Relaxed),
            dropped_closed: self.counters.dropped_closed.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: u64) -> VideoFrame {
        VideoFrame {
            timestamp_ns: ts,
            width: 2,
            height: 2,
            data: Bytes::from_static(&[0u8; 16]),
        }
    }

    #[test]
    fn test_full_queue_drops() {
        let (sink, _rx) = sample_channel(2);
        assert!(sink.submit_video(frame(1)));
        assert!(sink.submit_video(frame(2)));
        assert!(!sink.submit_video(frame(3)));

        let stats = sink.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.dropped_full, 1);
        assert_eq!(stats.bytes, 32);
    }

    #[test]
    fn test_closed_queue_drops() {
        let (sink, rx) = sample_channel(4);
        drop(rx);
        assert!(!sink.submit_video(frame(1)));
        assert_eq!(sink.stats().dropped_closed, 1);
        assert!(sink.is_closed());
    }
}
