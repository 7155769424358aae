//! Capture backend abstraction and the cpal implementation
//!
//! The pool talks to hardware through the `CaptureBackend` trait so the
//! recording engine can be driven by a mock in tests. The cpal backend
//! normalizes every device to stereo interleaved f32 chunks at the source:
//! mono is duplicated, extra channels are dropped.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::{Receiver, Sender};

use crate::error::{MixerError, MixerResult};
use crate::types::{DeviceKey, Sample};

/// One capture chunk: stereo interleaved f32 [L, R, L, R, ...]
pub type CaptureChunk = Vec<Sample>;

pub type ChunkSender = Sender<CaptureChunk>;
pub type ChunkReceiver = Receiver<CaptureChunk>;

/// Capacity of the monitor ring (interleaved samples, ~0.34s at 48kHz)
pub const MONITOR_RING_CAPACITY: usize = 1 << 15;

/// Fan-out of capture chunks to recording pipelines
///
/// Subscribers come and go between callbacks; the callback side uses
/// `try_lock` and drops the chunk rather than block the device thread.
pub struct ChunkRouter {
    senders: Mutex<Vec<ChunkSender>>,
}

impl ChunkRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: Mutex::new(Vec::new()),
        })
    }

    /// Open a new unbounded subscription
    pub fn subscribe(&self) -> ChunkReceiver {
        let (tx, rx) = crossbeam::channel::unbounded();
        if let Ok(mut senders) = self.senders.lock() {
            senders.push(tx);
        }
        rx
    }

    /// Deliver a chunk to every live subscriber, pruning dropped ones
    pub fn publish(&self, chunk: CaptureChunk) {
        if let Ok(mut senders) = self.senders.try_lock() {
            senders.retain(|tx| tx.send(chunk.clone()).is_ok());
        }
    }
}

/// Lock-free peak level published by the capture callback
pub struct LevelMeter {
    peak_bits: AtomicU32,
}

impl LevelMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peak_bits: AtomicU32::new(0),
        })
    }

    pub fn update(&self, peak: Sample) {
        self.peak_bits.store(peak.to_bits(), Ordering::Relaxed);
    }

    /// Peak amplitude of the most recent chunk
    pub fn peak(&self) -> Sample {
        Sample::from_bits(self.peak_bits.load(Ordering::Relaxed))
    }
}

/// Everything a backend wires into its capture callback
pub struct CaptureSinks {
    pub router: Arc<ChunkRouter>,
    pub level: Arc<LevelMeter>,
    /// Interleaved stereo ring drained by the render loop for monitoring
    pub monitor: rtrb::Producer<Sample>,
}

/// An input device available for capture
#[derive(Debug, Clone)]
pub struct InputDevice {
    pub name: String,
    pub is_default: bool,
}

/// Opens capture streams on physical input devices
pub trait CaptureBackend {
    /// Open a capture stream on the given device, feeding the sinks.
    /// Device-access rejection is a hard failure the caller must surface.
    fn open(&self, key: &DeviceKey, sinks: CaptureSinks) -> MixerResult<Box<dyn CaptureStream>>;

    /// Backend/OS-reported one-way latency estimate in seconds, used when
    /// calibration never detected the loopback click.
    fn reported_latency(&self) -> f64;

    /// Enumerate input devices
    fn input_devices(&self) -> MixerResult<Vec<InputDevice>>;
}

/// A live capture stream. Dropping it stops the device.
pub trait CaptureStream {
    fn is_live(&self) -> bool;
    fn sample_rate(&self) -> u32;
}

// ═══════════════════════════════════════════════════════════════════════════
// cpal implementation
// ═══════════════════════════════════════════════════════════════════════════

/// Conservative one-way latency estimate when cpal reports nothing usable
const CPAL_FALLBACK_LATENCY_SECS: f64 = 0.02;

pub struct CpalCaptureBackend;

impl CpalCaptureBackend {
    pub fn new() -> Self {
        Self
    }

    fn find_device(&self, key: &DeviceKey) -> MixerResult<cpal::Device> {
        let host = cpal::default_host();
        match key {
            DeviceKey::Default => host
                .default_input_device()
                .ok_or(MixerError::NoDevices),
            DeviceKey::Id(name) => host
                .input_devices()
                .map_err(|e| MixerError::DeviceAccess {
                    device: name.clone(),
                    reason: e.to_string(),
                })?
                .find(|d: &cpal::Device| d.name().ok().as_deref() == Some(name))
                .ok_or_else(|| MixerError::DeviceNotFound(name.clone())),
        }
    }
}

impl Default for CpalCaptureBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct CpalCaptureStream {
    // Held for its lifetime; dropping stops the device
    _stream: cpal::Stream,
    live: Arc<AtomicBool>,
    sample_rate: u32,
}

impl CaptureStream for CpalCaptureStream {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Normalize one callback's worth of samples to stereo interleaved f32
fn to_stereo_chunk(data: &[Sample], channels: u16) -> CaptureChunk {
    match channels {
        1 => {
            let mut out = Vec::with_capacity(data.len() * 2);
            for &s in data {
                out.push(s);
                out.push(s);
            }
            out
        }
        2 => data.to_vec(),
        n => {
            // Keep the first two channels of a multichannel interface
            let n = n as usize;
            let mut out = Vec::with_capacity(data.len() / n * 2);
            for frame in data.chunks_exact(n) {
                out.push(frame[0]);
                out.push(frame[1]);
            }
            out
        }
    }
}

impl CaptureBackend for CpalCaptureBackend {
    fn open(&self, key: &DeviceKey, mut sinks: CaptureSinks) -> MixerResult<Box<dyn CaptureStream>> {
        let device = self.find_device(key)?;
        let device_name = device.name().unwrap_or_else(|_| key.to_string());

        let config = device
            .default_input_config()
            .map_err(|e| MixerError::DeviceAccess {
                device: device_name.clone(),
                reason: e.to_string(),
            })?;

        if config.sample_format() != cpal::SampleFormat::F32 {
            return Err(MixerError::StreamBuild(format!(
                "unsupported capture sample format {:?} on '{}'",
                config.sample_format(),
                device_name
            )));
        }

        let channels = config.channels();
        let sample_rate = config.sample_rate().0;
        let live = Arc::new(AtomicBool::new(true));

        let router = Arc::clone(&sinks.router);
        let level = Arc::clone(&sinks.level);
        let err_live = Arc::clone(&live);

        let stream = device
            .build_input_stream(
                &config.into(),
                move |data: &[Sample], _: &cpal::InputCallbackInfo| {
                    let chunk = to_stereo_chunk(data, channels);

                    let peak = chunk.iter().fold(0.0f32, |m, s| m.max(s.abs()));
                    level.update(peak);

                    for &s in &chunk {
                        // Ring full means the monitor consumer is behind;
                        // dropping monitor samples is preferable to blocking
                        if sinks.monitor.push(s).is_err() {
                            break;
                        }
                    }

                    router.publish(chunk);
                },
                move |e| {
                    log::warn!("capture stream error: {}", e);
                    err_live.store(false, Ordering::Relaxed);
                },
                None,
            )
            .map_err(|e| MixerError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MixerError::StreamBuild(e.to_string()))?;

        log::info!(
            "Opened capture stream on '{}' ({} ch @ {}Hz)",
            device_name,
            channels,
            sample_rate
        );

        Ok(Box::new(CpalCaptureStream {
            _stream: stream,
            live,
            sample_rate,
        }))
    }

    fn reported_latency(&self) -> f64 {
        CPAL_FALLBACK_LATENCY_SECS
    }

    fn input_devices(&self) -> MixerResult<Vec<InputDevice>> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());

        let mut devices: Vec<InputDevice> = Vec::new();
        let iter = host
            .input_devices()
            .map_err(|e| MixerError::StreamBuild(e.to_string()))?;

        for device in iter {
            let Ok(name) = device.name() else { continue };
            let is_default = default_name.as_ref() == Some(&name);
            devices.push(InputDevice { name, is_default });
        }

        if devices.is_empty() {
            return Err(MixerError::NoDevices);
        }

        devices.sort_by(|a, b| b.is_default.cmp(&a.is_default).then_with(|| a.name.cmp(&b.name)));
        log::info!("Enumerated {} input devices", devices.len());
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_router_fanout_and_prune() {
        let router = ChunkRouter::new();
        let rx1 = router.subscribe();
        let rx2 = router.subscribe();

        router.publish(vec![0.1, 0.2]);
        assert_eq!(rx1.try_recv().unwrap(), vec![0.1, 0.2]);
        assert_eq!(rx2.try_recv().unwrap(), vec![0.1, 0.2]);

        drop(rx1);
        router.publish(vec![0.3, 0.4]);
        assert_eq!(rx2.try_recv().unwrap(), vec![0.3, 0.4]);
    }

    #[test]
    fn test_level_meter_roundtrip() {
        let meter = LevelMeter::new();
        assert_eq!(meter.peak(), 0.0);
        meter.update(0.75);
        assert_eq!(meter.peak(), 0.75);
    }

    #[test]
    fn test_to_stereo_chunk() {
        // Mono duplicates
        assert_eq!(to_stereo_chunk(&[0.5, 0.25], 1), vec![0.5, 0.5, 0.25, 0.25]);
        // Stereo passes through
        assert_eq!(to_stereo_chunk(&[0.1, 0.2], 2), vec![0.1, 0.2]);
        // Multichannel keeps the first pair
        assert_eq!(
            to_stereo_chunk(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], 4),
            vec![1.0, 2.0, 5.0, 6.0]
        );
    }
}
