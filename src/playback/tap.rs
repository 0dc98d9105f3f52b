//! Lock-free tap on the output path
//!
//! The realtime side writes every rendered sample into a ring buffer through
//! a [`TapWriter`]. A tap thread drains it in fixed blocks, advances the
//! session clock and forwards the blocks to the spectrum publisher.

use crate::playback::format::AudioFormat;
use crate::playback::spectrum::SpectrumPublisher;
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Realtime-safe producer half of the tap. Never allocates or blocks.
pub struct TapWriter {
    producer: HeapProd<f32>,
}

impl TapWriter {
    /// Copy rendered samples into the tap; drops what does not fit
    pub fn write(&mut self, samples: &[f32]) {
        let _ = self.producer.push_slice(samples);
    }
}

/// A running tap thread for one session
pub struct Tap {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Tap {
    /// Start a tap for a session rendering `format`.
    ///
    /// `clock` counts played frames and is reset to zero here.
    pub fn install(
        format: AudioFormat,
        block_frames: usize,
        publisher: Option<Arc<dyn SpectrumPublisher>>,
        clock: Arc<AtomicU64>,
    ) -> (Self, TapWriter) {
        let channels = format.channels.max(1) as usize;
        let block_frames = block_frames.max(1);
        // One second of audio, at least four blocks
        let capacity = (format.sample_rate as usize * channels).max(block_frames * channels * 4);
        let (producer, consumer) = HeapRb::<f32>::new(capacity).split();

        clock.store(0, Ordering::SeqCst);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let spawned = thread::Builder::new()
            .name("murmur-tap".into())
            .spawn(move || {
                run_tap(consumer, format, block_frames, publisher, clock, flag);
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to spawn tap thread: {}", e);
                None
            }
        };

        (Self { shutdown, handle }, TapWriter { producer })
    }

    /// Stop the tap thread, flushing what is left and signalling the end
    pub fn remove(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn run_tap(
    mut consumer: HeapCons<f32>,
    format: AudioFormat,
    block_frames: usize,
    publisher: Option<Arc<dyn SpectrumPublisher>>,
    clock: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
) {
    let channels = format.channels.max(1) as usize;
    let mut block = vec![0.0f32; block_frames * channels];

    loop {
        let stopping = shutdown.load(Ordering::SeqCst);

        if consumer.occupied_len() >= block.len() {
            let n = consumer.pop_slice(&mut block);
            forward(&block[..n], channels, format, publisher.as_deref(), &clock);
            continue;
        }

        if stopping {
            // Flush the partial tail
            let n = consumer.pop_slice(&mut block);
            if n > 0 {
                forward(&block[..n], channels, format, publisher.as_deref(), &clock);
            }
            break;
        }

        thread::sleep(POLL_INTERVAL);
    }

    if let Some(publisher) = publisher {
        publisher.end();
    }
    debug!(
        "Tap finished after {} frames",
        clock.load(Ordering::SeqCst)
    );
}

fn forward(
    samples: &[f32],
    channels: usize,
    format: AudioFormat,
    publisher: Option<&dyn SpectrumPublisher>,
    clock: &AtomicU64,
) {
    clock.fetch_add((samples.len() / channels) as u64, Ordering::SeqCst);
    if let Some(publisher) = publisher {
        publisher.publish(samples, format.channels, format.sample_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        blocks: Mutex<Vec<usize>>,
        ended: AtomicBool,
    }

    impl SpectrumPublisher for Recorder {
        fn publish(&self, block: &[f32], _channels: u16, _sample_rate: u32) {
            self.blocks.lock().push(block.len());
        }

        fn end(&self) {
            self.ended.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_blocks_clock_and_end_signal() {
        let recorder = Arc::new(Recorder::default());
        let clock = Arc::new(AtomicU64::new(99));
        let format = AudioFormat::f32(8000, 2);

        let (tap, mut writer) = Tap::install(
            format,
            100,
            Some(recorder.clone() as Arc<dyn SpectrumPublisher>),
            Arc::clone(&clock),
        );
        writer.write(&vec![0.1; 450]);
        tap.remove();

        // 225 frames: two full blocks of 100 and a flushed tail of 25
        assert_eq!(clock.load(Ordering::SeqCst), 225);
        assert_eq!(*recorder.blocks.lock(), vec![200, 200, 50]);
        assert!(recorder.ended.load(Ordering::SeqCst));
    }

    #[test]
    fn test_tap_without_publisher() {
        let clock = Arc::new(AtomicU64::new(0));
        let (tap, mut writer) = Tap::install(AudioFormat::f32(8000, 1), 10, None, clock.clone());
        writer.write(&[0.0; 30]);
        tap.remove();
        assert_eq!(clock.load(Ordering::SeqCst), 30);
    }
}
