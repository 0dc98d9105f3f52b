//! Frequency-domain view of the audio being played

use crate::events::{EventBus, Subscription};
use parking_lot::Mutex;
use rustfft::{num_complex::Complex, FftPlanner};
use std::sync::Arc;

/// Sink for sample blocks tapped from the output path.
///
/// `publish` is called from the tap thread, never from the realtime
/// callback. `end` is called once when the session is torn down.
pub trait SpectrumPublisher: Send + Sync {
    fn publish(&self, block: &[f32], channels: u16, sample_rate: u32);
    fn end(&self);
}

/// Magnitudes of one analysed block
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumFrame {
    pub magnitudes: Vec<f32>,
    pub sample_rate: u32,
    /// Width of one bin in Hz
    pub bin_hz: f32,
}

impl SpectrumFrame {
    /// Center frequency of the strongest bin
    pub fn peak_frequency(&self) -> Option<f32> {
        self.magnitudes
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(idx, _)| idx as f32 * self.bin_hz)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpectrumEvent {
    Frame(SpectrumFrame),
    /// The session feeding the analyser ended
    End,
}

/// Hann-windowed FFT over the mono mix of each block
pub struct SpectrumAnalyzer {
    fft_size: usize,
    planner: Mutex<FftPlanner<f32>>,
    window: Vec<f32>,
    events: EventBus<SpectrumEvent>,
}

impl SpectrumAnalyzer {
    pub fn new(fft_size: usize) -> Arc<Self> {
        let fft_size = fft_size.max(2);
        Arc::new(Self {
            fft_size,
            planner: Mutex::new(FftPlanner::new()),
            window: hann_window(fft_size),
            events: EventBus::new(),
        })
    }

    pub fn subscribe(&self) -> Subscription<SpectrumEvent> {
        self.events.subscribe()
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    fn analyse(&self, block: &[f32], channels: u16, sample_rate: u32) -> SpectrumFrame {
        let channels = channels.max(1) as usize;
        let mut buffer: Vec<Complex<f32>> = block
            .chunks_exact(channels)
            .take(self.fft_size)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .zip(&self.window)
            .map(|(sample, w)| Complex::new(sample * w, 0.0))
            .collect();
        buffer.resize(self.fft_size, Complex::new(0.0, 0.0));

        let fft = self.planner.lock().plan_fft_forward(self.fft_size);
        fft.process(&mut buffer);

        let scale = 2.0 / self.fft_size as f32;
        let magnitudes = buffer[..self.fft_size / 2]
            .iter()
            .map(|c| c.norm() * scale)
            .collect();

        SpectrumFrame {
            magnitudes,
            sample_rate,
            bin_hz: sample_rate as f32 / self.fft_size as f32,
        }
    }
}

impl SpectrumPublisher for SpectrumAnalyzer {
    fn publish(&self, block: &[f32], channels: u16, sample_rate: u32) {
        if block.is_empty() {
            return;
        }
        let frame = self.analyse(block, channels, sample_rate);
        self.events.publish(SpectrumEvent::Frame(frame));
    }

    fn end(&self) {
        self.events.publish(SpectrumEvent::End);
    }
}

fn hann_window(len: usize) -> Vec<f32> {
    let denom = (len - 1) as f32;
    (0..len)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / denom).cos()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hann_window_shape() {
        let window = hann_window(5);
        assert!(window[0].abs() < 1e-6);
        assert!((window[2] - 1.0).abs() < 1e-6);
        assert!(window[4].abs() < 1e-6);
    }

    #[test]
    fn test_peak_at_tone_frequency() {
        let analyzer = SpectrumAnalyzer::new(1024);
        let events = analyzer.subscribe();

        let rate = 48000;
        // 1500 Hz lands exactly on bin 32 for a 1024-point FFT at 48 kHz
        let block: Vec<f32> = (0..1024)
            .map(|i| (2.0 * std::f32::consts::PI * 1500.0 * i as f32 / rate as f32).sin())
            .collect();
        analyzer.publish(&block, 1, rate);

        match events.try_recv() {
            Some(SpectrumEvent::Frame(frame)) => {
                assert_eq!(frame.magnitudes.len(), 512);
                let peak = frame.peak_frequency().unwrap();
                assert!((peak - 1500.0).abs() <= frame.bin_hz);
            }
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_stereo_mixdown_and_end() {
        let analyzer = SpectrumAnalyzer::new(64);
        let events = analyzer.subscribe();

        analyzer.publish(&[0.5; 128], 2, 8000);
        analyzer.publish(&[], 2, 8000);
        analyzer.end();

        let received = events.drain();
        assert_eq!(received.len(), 2);
        assert!(matches!(received[0], SpectrumEvent::Frame(_)));
        assert_eq!(received[1], SpectrumEvent::End);
    }
}
