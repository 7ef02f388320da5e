use std::f32::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
    #[error("capture device ended")]
    Ended,
    #[error("unsupported capture format: {0}")]
    Format(String),
}

/// Blocking source of mono `f32` capture frames.
pub trait CaptureDevice: Send {
    fn name(&self) -> &str;

    /// Fill `frame` with the next samples, blocking until they are available.
    fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), DeviceError>;
}

/// Opens capture devices; called again whenever a device must be reacquired.
pub trait DeviceProvider: Send + Sync {
    fn open(
        &self,
        sample_rate: u32,
        channels: u16,
        frame_samples: usize,
    ) -> Result<Box<dyn CaptureDevice>, DeviceError>;
}

#[cfg(feature = "pulse")]
mod pulse {
    use libpulse_binding as pulse;
    use libpulse_simple_binding::Simple;
    use tracing::info;

    use super::{CaptureDevice, DeviceError, DeviceProvider};

    /// Default (or named) PulseAudio source, captured as s16le.
    pub struct PulseMicrophone {
        simple: Simple,
        name: String,
        channels: usize,
        pcm_buffer: Vec<u8>,
    }

    impl PulseMicrophone {
        pub fn open(
            source: Option<&str>,
            sample_rate: u32,
            channels: u16,
            frame_samples: usize,
        ) -> Result<Self, DeviceError> {
            let channel_count = u8::try_from(channels)
                .ok()
                .filter(|c| (1..=2).contains(c))
                .ok_or_else(|| DeviceError::Format(format!("{channels} channels")))?;
            let spec = pulse::sample::Spec {
                format: pulse::sample::Format::S16le,
                channels: channel_count,
                rate: sample_rate,
            };
            if !spec.is_valid() {
                return Err(DeviceError::Format(format!("{sample_rate} Hz")));
            }

            let frame_bytes = frame_samples * usize::from(channel_count) * 2;
            // One capture frame per fragment keeps latency at the frame size.
            let buf_attr = pulse::def::BufferAttr {
                maxlength: u32::MAX,
                tlength: u32::MAX,
                prebuf: u32::MAX,
                minreq: u32::MAX,
                fragsize: frame_bytes as u32,
            };

            let simple = Simple::new(
                None,
                "vortex-mesh",
                pulse::stream::Direction::Record,
                source,
                "microphone",
                &spec,
                None,
                Some(&buf_attr),
            )
            .map_err(|e| DeviceError::Unavailable(format!("PulseAudio connection failed: {e}")))?;

            let name = source.unwrap_or("default").to_string();
            info!(device = %name, sample_rate, channels, frame_bytes, "Microphone opened");
            Ok(Self {
                simple,
                name,
                channels: usize::from(channel_count),
                pcm_buffer: vec![0u8; frame_bytes],
            })
        }
    }

    impl CaptureDevice for PulseMicrophone {
        fn name(&self) -> &str {
            &self.name
        }

        fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), DeviceError> {
            self.simple.read(&mut self.pcm_buffer).map_err(|e| {
                info!(device = %self.name, "PulseAudio read failed: {e}");
                DeviceError::Ended
            })?;
            // Downmix interleaved s16le to mono f32.
            let bytes_per_frame = self.channels * 2;
            for (out, chunk) in frame
                .iter_mut()
                .zip(self.pcm_buffer.chunks_exact(bytes_per_frame))
            {
                let sum: i32 = chunk
                    .chunks_exact(2)
                    .map(|b| i32::from(i16::from_le_bytes([b[0], b[1]])))
                    .sum();
                *out = sum as f32 / (self.channels as f32 * f32::from(i16::MAX));
            }
            Ok(())
        }
    }

    /// Opens the default PulseAudio source, or a named one.
    #[derive(Debug, Default, Clone)]
    pub struct PulseProvider {
        pub source: Option<String>,
    }

    impl DeviceProvider for PulseProvider {
        fn open(
            &self,
            sample_rate: u32,
            channels: u16,
            frame_samples: usize,
        ) -> Result<Box<dyn CaptureDevice>, DeviceError> {
            let mic = PulseMicrophone::open(
                self.source.as_deref(),
                sample_rate,
                channels,
                frame_samples,
            )?;
            Ok(Box::new(mic))
        }
    }
}

#[cfg(feature = "pulse")]
pub use pulse::{PulseMicrophone, PulseProvider};

/// Synthetic sine source, optionally paced in real time.
pub struct ToneDevice {
    phase: f32,
    step: f32,
    amplitude: f32,
    pace: Option<Duration>,
    frames_left: Option<u64>,
}

impl ToneDevice {
    pub fn new(frequency: f32, amplitude: f32, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency / sample_rate.max(1) as f32,
            amplitude,
            pace: None,
            frames_left: None,
        }
    }

    /// Sleep for one frame duration per read, like a real device.
    pub fn paced(mut self, frame: Duration) -> Self {
        self.pace = Some(frame);
        self
    }

    /// Report the device as ended after `frames` reads.
    pub fn ending_after(mut self, frames: u64) -> Self {
        self.frames_left = Some(frames);
        self
    }
}

impl CaptureDevice for ToneDevice {
    fn name(&self) -> &str {
        "tone"
    }

    fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), DeviceError> {
        if let Some(left) = self.frames_left.as_mut() {
            if *left == 0 {
                return Err(DeviceError::Ended);
            }
            *left -= 1;
        }
        if let Some(pace) = self.pace {
            std::thread::sleep(pace);
        }
        for sample in frame.iter_mut() {
            *sample = self.phase.sin() * self.amplitude;
            self.phase = (self.phase + self.step) % TAU;
        }
        Ok(())
    }
}

/// Hands out [`ToneDevice`]s and counts how often a device was opened.
#[derive(Debug)]
pub struct ToneProvider {
    frequency: f32,
    amplitude: f32,
    paced: bool,
    end_first_after: Option<u64>,
    opened: AtomicUsize,
}

impl ToneProvider {
    pub fn new(frequency: f32, amplitude: f32) -> Arc<Self> {
        Arc::new(Self {
            frequency,
            amplitude,
            paced: true,
            end_first_after: None,
            opened: AtomicUsize::new(0),
        })
    }

    /// Unpaced tone whose first device ends after `frames` reads.
    pub fn flaky(frequency: f32, amplitude: f32, frames: u64) -> Arc<Self> {
        Arc::new(Self {
            frequency,
            amplitude,
            paced: false,
            end_first_after: Some(frames),
            opened: AtomicUsize::new(0),
        })
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

impl DeviceProvider for ToneProvider {
    fn open(
        &self,
        sample_rate: u32,
        _channels: u16,
        frame_samples: usize,
    ) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let first = self.opened.fetch_add(1, Ordering::Relaxed) == 0;
        let mut device = ToneDevice::new(self.frequency, self.amplitude, sample_rate);
        if self.paced {
            let frame = Duration::from_secs_f64(frame_samples as f64 / f64::from(sample_rate.max(1)));
            device = device.paced(frame);
        }
        match self.end_first_after {
            Some(frames) if first => Ok(Box::new(device.ending_after(frames))),
            _ => Ok(Box::new(device)),
        }
    }
}
