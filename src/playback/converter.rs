//! Conversion of foreign-format buffers to the engine's native format

use crate::playback::format::{AudioFormat, PlaybackBuffer, SampleFormat};
use crate::{MurmurError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Converts buffers of one source format into native f32 samples.
///
/// A converter lives for one playback session and keeps resampler state
/// between buffers, so a buffer's converted output may lag its input.
/// [`FormatConverter::flush`] releases what is still held back.
pub trait FormatConverter: Send {
    /// The only format this converter accepts
    fn source(&self) -> AudioFormat;

    /// Convert to interleaved f32 samples in the target format
    fn convert(&mut self, buffer: &PlaybackBuffer) -> Result<Vec<f32>>;

    /// Emit everything held back by earlier `convert` calls. Called once the
    /// session has nothing else to play.
    fn flush(&mut self) -> Result<Vec<f32>> {
        Ok(Vec::new())
    }
}

/// Creates converters on demand
pub trait ConverterFactory: Send {
    fn create(&self, from: AudioFormat, to: AudioFormat) -> Result<Box<dyn FormatConverter>>;
}

/// Default factory producing [`RubatoConverter`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct RubatoConverterFactory;

impl ConverterFactory for RubatoConverterFactory {
    fn create(&self, from: AudioFormat, to: AudioFormat) -> Result<Box<dyn FormatConverter>> {
        Ok(Box::new(RubatoConverter::new(from, to)?))
    }
}

/// Sinc resampler fed across buffer boundaries.
///
/// Input frames that do not fill a whole chunk wait for the next call, and
/// the resampler's startup delay is trimmed so output lines up with input.
struct SincStream {
    resampler: SincFixedIn<f32>,
    ratio: f64,
    /// Planar input frames not yet resampled
    pending: Vec<Vec<f32>>,
    /// Leading output frames still to drop
    skip: usize,
    frames_in: u64,
    frames_out: u64,
}

impl SincStream {
    fn new(resampler: SincFixedIn<f32>, ratio: f64, channels: usize) -> Self {
        let skip = resampler.output_delay();
        Self {
            resampler,
            ratio,
            pending: vec![Vec::new(); channels],
            skip,
            frames_in: 0,
            frames_out: 0,
        }
    }

    fn push(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let channels = self.pending.len();
        for frame in input.chunks_exact(channels) {
            for (plane, sample) in self.pending.iter_mut().zip(frame) {
                plane.push(*sample);
            }
        }
        self.frames_in += (input.len() / channels) as u64;

        let mut output = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|plane| plane.drain(..needed).collect())
                .collect();
            self.process(&chunk, &mut output)?;
        }
        Ok(output)
    }

    /// Pad the remainder with silence until every input frame has come out,
    /// then start over clean
    fn flush(&mut self) -> Result<Vec<f32>> {
        let channels = self.pending.len();
        let expected = (self.frames_in as f64 * self.ratio).round() as u64;
        let mut output = Vec::new();

        while self.frames_out < expected {
            let needed = self.resampler.input_frames_next();
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|plane| {
                    let mut chunk: Vec<f32> = plane.drain(..).collect();
                    chunk.resize(needed, 0.0);
                    chunk
                })
                .collect();
            self.process(&chunk, &mut output)?;
        }

        let excess = (self.frames_out - expected.min(self.frames_out)) as usize;
        let keep = output.len() - (excess * channels).min(output.len());
        output.truncate(keep);

        self.resampler.reset();
        self.skip = self.resampler.output_delay();
        self.frames_in = 0;
        self.frames_out = 0;
        Ok(output)
    }

    fn process(&mut self, chunk: &[Vec<f32>], output: &mut Vec<f32>) -> Result<()> {
        let planar = self.resampler.process(chunk, None).map_err(|e| {
            MurmurError::AudioProcessingError(format!("Resampling failed: {}", e))
        })?;

        let frames = planar.first().map(|plane| plane.len()).unwrap_or(0);
        for frame_idx in 0..frames {
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            for plane in &planar {
                output.push(plane[frame_idx]);
            }
            self.frames_out += 1;
        }
        Ok(())
    }
}

/// Sample-type decoding, sinc resampling and channel remapping
pub struct RubatoConverter {
    from: AudioFormat,
    to: AudioFormat,
    stream: Option<SincStream>,
}

impl RubatoConverter {
    pub fn new(from: AudioFormat, to: AudioFormat) -> Result<Self> {
        if from.sample_rate == 0 || to.sample_rate == 0 {
            return Err(MurmurError::AudioProcessingError(
                "Sample rates must be greater than 0".into(),
            ));
        }

        if from.channels == 0 || to.channels == 0 {
            return Err(MurmurError::AudioProcessingError(
                "Number of channels must be greater than 0".into(),
            ));
        }

        if to.sample_format != SampleFormat::F32 {
            return Err(MurmurError::AudioProcessingError(format!(
                "Unsupported target sample format {:?}",
                to.sample_format
            )));
        }

        let stream = if from.sample_rate != to.sample_rate {
            let resample_ratio = to.sample_rate as f64 / from.sample_rate as f64;

            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };

            // Resample at the source channel count, remap afterwards
            let resampler = SincFixedIn::<f32>::new(
                resample_ratio,
                2.0,
                params,
                1024,
                from.channels as usize,
            )
            .map_err(|e| {
                MurmurError::AudioProcessingError(format!("Failed to create resampler: {}", e))
            })?;
            Some(SincStream::new(
                resampler,
                resample_ratio,
                from.channels as usize,
            ))
        } else {
            None
        };

        debug!("Created converter: {} -> {}", from, to);

        Ok(Self { from, to, stream })
    }

    fn remap(&self, samples: &[f32]) -> Vec<f32> {
        remap_channels(samples, self.from.channels as usize, self.to.channels as usize)
    }
}

impl FormatConverter for RubatoConverter {
    fn source(&self) -> AudioFormat {
        self.from
    }

    fn convert(&mut self, buffer: &PlaybackBuffer) -> Result<Vec<f32>> {
        if buffer.format() != self.from {
            return Err(MurmurError::AudioProcessingError(format!(
                "Converter for {} cannot take {}",
                self.from,
                buffer.format()
            )));
        }

        let decoded = buffer.samples().to_f32();
        if decoded.len() % self.from.channels as usize != 0 {
            return Err(MurmurError::AudioProcessingError(format!(
                "{} samples do not divide into {} channels",
                decoded.len(),
                self.from.channels
            )));
        }

        match self.stream.as_mut() {
            Some(stream) => {
                let resampled = stream.push(&decoded)?;
                Ok(self.remap(&resampled))
            }
            None => Ok(self.remap(&decoded)),
        }
    }

    fn flush(&mut self) -> Result<Vec<f32>> {
        match self.stream.as_mut() {
            Some(stream) => {
                let tail = stream.flush()?;
                Ok(self.remap(&tail))
            }
            None => Ok(Vec::new()),
        }
    }
}

/// Map interleaved frames between channel counts.
///
/// Mono is duplicated to every output channel, anything is averaged down to
/// mono, and other layouts wrap input channels around.
pub fn remap_channels(input: &[f32], from: usize, to: usize) -> Vec<f32> {
    if from == to || from == 0 || to == 0 {
        return input.to_vec();
    }

    let frames = input.len() / from;
    let mut output = Vec::with_capacity(frames * to);
    for frame in input.chunks_exact(from) {
        if to == 1 {
            output.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            for ch in 0..to {
                output.push(frame[ch % from]);
            }
        }
    }
    output
}
