//! cpal backend - real audio devices
//!
//! Output streams drive a `Renderer`, input streams push into a capture
//! ring. Both handle F32, I16 and U16 devices through one generic builder
//! per direction.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};

use super::backend::{capture_ring, AudioBackend, Capture, CaptureWriter, InputStream, OutputStream};
use super::context::Renderer;
use crate::error::BackendError;

/// Backend using the default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    /// Names of the output devices the host reports
    pub fn output_device_names() -> Vec<String> {
        let host = cpal::default_host();
        match host.output_devices() {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(e) => {
                log::warn!("Failed to enumerate output devices: {}", e);
                Vec::new()
            }
        }
    }

    /// Names of the input devices the host reports
    pub fn input_device_names() -> Vec<String> {
        let host = cpal::default_host();
        match host.input_devices() {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(e) => {
                log::warn!("Failed to enumerate input devices: {}", e);
                Vec::new()
            }
        }
    }
}

fn find_output_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, BackendError> {
    match name {
        None => host.default_output_device().ok_or(BackendError::NoDevice("output")),
        Some(name) => host
            .output_devices()
            .map_err(|e| BackendError::Stream(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| BackendError::DeviceNotFound(name.to_string())),
    }
}

fn find_input_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, BackendError> {
    match name {
        None => host.default_input_device().ok_or(BackendError::NoDevice("input")),
        Some(name) => host
            .input_devices()
            .map_err(|e| BackendError::Stream(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| BackendError::DeviceNotFound(name.to_string())),
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut renderer: Renderer,
) -> Result<cpal::Stream, BackendError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                renderer.write(data, channels);
            },
            |err| log::error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| BackendError::Stream(e.to_string()))
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut writer: CaptureWriter,
) -> Result<cpal::Stream, BackendError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                writer.push(data, |s| s.to_sample::<f32>());
            },
            |err| log::error!("Audio input stream error: {}", err),
            None,
        )
        .map_err(|e| BackendError::Stream(e.to_string()))
}

struct CpalOutput {
    stream: cpal::Stream,
    sample_rate: u32,
    channels: u16,
}

impl OutputStream for CpalOutput {
    fn play(&self) -> Result<(), BackendError> {
        self.stream.play().map_err(|e| BackendError::Stream(e.to_string()))
    }

    fn pause(&self) -> Result<(), BackendError> {
        self.stream.pause().map_err(|e| BackendError::Stream(e.to_string()))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

/// Holding the stream keeps the microphone open
struct CpalInput {
    _stream: cpal::Stream,
    sample_rate: u32,
    channels: u16,
}

impl InputStream for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        log::debug!("Input stream closed ({} Hz, {} ch)", self.sample_rate, self.channels);
    }
}

impl AudioBackend for CpalBackend {
    fn open_output(
        &self,
        device: Option<&str>,
        mut renderer: Renderer,
    ) -> Result<Box<dyn OutputStream>, BackendError> {
        let host = cpal::default_host();
        let device = find_output_device(&host, device)?;

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        log::info!("Using output device: {}", device_name);

        let supported = device
            .default_output_config()
            .map_err(|e| BackendError::Stream(e.to_string()))?;
        log::info!("Output config: {:?}", supported);

        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        renderer.set_sample_rate(config.sample_rate.0);

        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, renderer)?,
            cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, renderer)?,
            cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, renderer)?,
            format => return Err(BackendError::UnsupportedFormat(format!("{:?}", format))),
        };

        Ok(Box::new(CpalOutput {
            stream,
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        }))
    }

    fn open_input(&self, device: Option<&str>, capture_seconds: f32) -> Result<Capture, BackendError> {
        let host = cpal::default_host();
        let device = find_input_device(&host, device)?;

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        log::info!("Using input device: {}", device_name);

        // Platforms report a refused microphone permission here
        let supported = device
            .default_input_config()
            .map_err(|e| BackendError::Denied(e.to_string()))?;

        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let sample_rate = config.sample_rate.0;
        let channels = config.channels;
        let (writer, consumer) = capture_ring(sample_rate, channels, capture_seconds);
        let dropped = writer.dropped();

        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_input::<f32>(&device, &config, writer)?,
            cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, writer)?,
            cpal::SampleFormat::U16 => build_input::<u16>(&device, &config, writer)?,
            format => return Err(BackendError::UnsupportedFormat(format!("{:?}", format))),
        };
        stream
            .play()
            .map_err(|e| BackendError::Denied(e.to_string()))?;

        Ok(Capture {
            stream: Box::new(CpalInput {
                _stream: stream,
                sample_rate,
                channels,
            }),
            consumer,
            dropped,
            sample_rate,
            channels,
        })
    }
}
