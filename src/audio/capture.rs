//! Input device backend.
//!
//! [`open_input`] binds a [`CaptureSink`] to an input device.  With the
//! `device-capture` feature the device is driven by `cpal` on a dedicated
//! `capture-device` thread (cpal streams are not `Send` everywhere, so the
//! stream is built, played and dropped on that thread).  Without the feature
//! every call returns [`CaptureError::BackendUnavailable`] and callers fall
//! back to feeding samples themselves.
//!
//! ```text
//! cpal callback ──on_samples──► CaptureSink
//!               ──on_error────►
//! DeviceStream (RAII) ──drop──► stop signal ──► stream dropped, thread joined
//! ```

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("no input device found on the default audio host")]
    NoDevice,

    #[error("input device `{0}` not found")]
    DeviceNotFound(String),

    #[error("device capture is not compiled in (enable the `device-capture` feature)")]
    BackendUnavailable,

    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("audio backend error: {0}")]
    Backend(String),

    #[error("capture graph has not been acquired")]
    NotAcquired,
}

// ---------------------------------------------------------------------------
// CaptureSink
// ---------------------------------------------------------------------------

/// Receiver of device audio.  Called from the audio thread; must not block.
pub trait CaptureSink: Send + Sync + 'static {
    /// Interleaved samples in the device's native format.
    fn on_samples(&self, samples: &[f32], sample_rate: u32, channels: u16);

    fn on_error(&self, message: String);
}

const _: fn() = || {
    fn _assert_object_safe(_: Arc<dyn CaptureSink>) {}
};

// ---------------------------------------------------------------------------
// DeviceStream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// RAII handle for a running input stream.  Dropping it stops the stream
/// and joins the device thread.
pub struct DeviceStream {
    info: DeviceInfo,
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceStream {
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        // Closing the channel wakes the device thread.
        self.stop.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::warn!("capture: device thread panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// open_input
// ---------------------------------------------------------------------------

/// Start streaming from `device` (or the default input) into `sink`.
#[cfg(feature = "device-capture")]
pub fn open_input(device: Option<&str>, sink: Arc<dyn CaptureSink>) -> Result<DeviceStream, CaptureError> {
    let wanted = device.map(str::to_string);
    let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<DeviceInfo, CaptureError>>(1);
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let thread = std::thread::Builder::new()
        .name("capture-device".into())
        .spawn(move || match cpal_backend::start(wanted.as_deref(), sink) {
            Ok((stream, info)) => {
                let _ = ready_tx.send(Ok(info));
                // Blocks until the DeviceStream is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        })
        .map_err(|e| CaptureError::Backend(format!("failed to spawn capture thread: {e}")))?;

    match ready_rx.recv() {
        Ok(Ok(info)) => {
            log::info!(
                "capture: streaming from `{}` ({} Hz, {} ch)",
                info.name,
                info.sample_rate,
                info.channels
            );
            Ok(DeviceStream {
                info,
                stop: Some(stop_tx),
                thread: Some(thread),
            })
        }
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(CaptureError::Backend("capture thread exited during startup".into()))
        }
    }
}

#[cfg(not(feature = "device-capture"))]
pub fn open_input(_device: Option<&str>, _sink: Arc<dyn CaptureSink>) -> Result<DeviceStream, CaptureError> {
    Err(CaptureError::BackendUnavailable)
}

#[cfg(feature = "device-capture")]
mod cpal_backend {
    use std::sync::Arc;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    use super::{CaptureError, CaptureSink, DeviceInfo};

    fn backend<E: std::fmt::Display>(e: E) -> CaptureError {
        CaptureError::Backend(e.to_string())
    }

    pub(super) fn start(
        wanted: Option<&str>,
        sink: Arc<dyn CaptureSink>,
    ) -> Result<(cpal::Stream, DeviceInfo), CaptureError> {
        let host = cpal::default_host();
        let device = match wanted {
            Some(name) => host
                .input_devices()
                .map_err(backend)?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| CaptureError::DeviceNotFound(name.to_string()))?,
            None => host.default_input_device().ok_or(CaptureError::NoDevice)?,
        };

        let supported = device.default_input_config().map_err(backend)?;
        let format = supported.sample_format();
        let info = DeviceInfo {
            name: device.name().unwrap_or_else(|_| "unknown".into()),
            sample_rate: supported.sample_rate().0,
            channels: supported.channels(),
        };
        let config: cpal::StreamConfig = supported.into();
        let (rate, channels) = (info.sample_rate, info.channels);

        let err_sink = Arc::clone(&sink);
        let on_error = move |err: cpal::StreamError| err_sink.on_error(err.to_string());

        let stream = match format {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| sink.on_samples(data, rate, channels),
                on_error,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let converted: Vec<f32> = data.iter().map(|&s| s as f32 / 32_768.0).collect();
                    sink.on_samples(&converted, rate, channels);
                },
                on_error,
                None,
            ),
            other => return Err(CaptureError::UnsupportedFormat(format!("{other:?}"))),
        }
        .map_err(backend)?;

        stream.play().map_err(backend)?;
        Ok((stream, info))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    impl CaptureSink for NullSink {
        fn on_samples(&self, _: &[f32], _: u32, _: u16) {}
        fn on_error(&self, _: String) {}
    }

    #[test]
    fn device_info_serializes_camel_case() {
        let info = DeviceInfo {
            name: "USB Mic".into(),
            sample_rate: 44_100,
            channels: 2,
        };
        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["sampleRate"], 44_100);
    }

    #[cfg(not(feature = "device-capture"))]
    #[test]
    fn without_backend_open_reports_unavailable() {
        let result = open_input(None, Arc::new(NullSink));
        assert_eq!(result.err(), Some(CaptureError::BackendUnavailable));
    }

    #[test]
    fn sink_is_object_safe() {
        let _sink: Arc<dyn CaptureSink> = Arc::new(NullSink);
    }
}
