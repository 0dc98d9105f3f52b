pub mod converter;
pub mod device;
pub mod engine;
pub mod format;
pub mod output;
pub mod spectrum;
pub mod tap;

pub use converter::{ConverterFactory, FormatConverter, RubatoConverter, RubatoConverterFactory};
pub use device::{ClaimMode, ClaimToken, DeviceArbitrator, OwnerId, Revocation};
pub use engine::{EngineHandle, EngineParts, PipelineFailure, PlaybackEngine, SessionStatus};
pub use format::{AudioFormat, PlaybackBuffer, SampleFormat, Samples};
pub use output::{open_output_device, OutputDevice, OutputStream, Pacing, VirtualOutputDevice};
pub use spectrum::{SpectrumAnalyzer, SpectrumEvent, SpectrumFrame, SpectrumPublisher};
