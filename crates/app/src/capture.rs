//! Live audio input. Only available with the `capture` feature; without it
//! every call reports that no device is available.

use clift_core::{audio::AudioProducer, config::AudioConfig, worker::Worker, Result};

#[cfg(feature = "capture")]
pub use device::{detect_input, spawn_capture};

#[cfg(not(feature = "capture"))]
pub fn detect_input(_config: &mut AudioConfig) -> Result<()> {
    Err(clift_core::CliftError::msg("built without audio capture support"))
}

#[cfg(not(feature = "capture"))]
pub fn spawn_capture(_producer: AudioProducer) -> Result<Worker> {
    Err(clift_core::CliftError::msg("built without audio capture support"))
}

#[cfg(feature = "capture")]
mod device {
    use std::time::Duration;

    use clift_core::CliftError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use crossbeam_channel::bounded;
    use tracing::{info, warn};

    use super::{AudioConfig, AudioProducer, Result, Worker};

    const READY_TIMEOUT: Duration = Duration::from_secs(2);
    const IDLE_POLL: Duration = Duration::from_millis(50);

    fn default_device() -> Result<cpal::Device> {
        cpal::default_host()
            .default_input_device()
            .ok_or_else(|| CliftError::msg("no audio input device"))
    }

    /// Adopts the default input device's sample rate and channel count.
    pub fn detect_input(config: &mut AudioConfig) -> Result<()> {
        let device = default_device()?;
        let supported = device
            .default_input_config()
            .map_err(|error| CliftError::msg(format!("input config unavailable: {error}")))?;
        config.sample_rate = supported.sample_rate().0;
        config.channels = supported.channels() as usize;
        info!(
            device = %device.name().unwrap_or_default(),
            sample_rate = config.sample_rate,
            channels = config.channels,
            "audio input found"
        );
        Ok(())
    }

    /// Opens the default input on a worker thread and pushes every callback
    /// buffer into `producer`. The stream lives and dies with the worker.
    pub fn spawn_capture(producer: AudioProducer) -> Result<Worker> {
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);

        let worker = Worker::spawn("clift-capture", move |stop| {
            let stream = match open_stream(producer) {
                Ok(stream) => stream,
                Err(error) => {
                    let _ = ready_tx.send(Err(error.to_string()));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            while stop.sleep(IDLE_POLL) {}
            drop(stream);
        })?;

        match ready_rx.recv_timeout(READY_TIMEOUT) {
            Ok(Ok(())) => Ok(worker),
            Ok(Err(message)) => Err(CliftError::Message(message)),
            Err(_) => Err(CliftError::msg("audio input did not start in time")),
        }
    }

    fn open_stream(producer: AudioProducer) -> Result<cpal::Stream> {
        let device = default_device()?;
        let config = device
            .default_input_config()
            .map_err(|error| CliftError::msg(format!("input config unavailable: {error}")))?;
        if config.sample_format() != cpal::SampleFormat::F32 {
            return Err(CliftError::msg(format!(
                "unsupported sample format {:?}",
                config.sample_format()
            )));
        }

        let stream = device
            .build_input_stream(
                &config.into(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| producer.push_slice(data),
                |error| warn!(%error, "audio input stream error"),
                None,
            )
            .map_err(|error| CliftError::msg(format!("cannot open input stream: {error}")))?;
        stream
            .play()
            .map_err(|error| CliftError::msg(format!("cannot start input stream: {error}")))?;
        Ok(stream)
    }
}
