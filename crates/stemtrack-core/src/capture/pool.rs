//! Device stream pool
//!
//! At most one live capture stream per device key. Opening a stream is a
//! user-visible permission/ownership event on some platforms, so streams
//! are reused across recording sessions and calibration runs; a dead
//! stream (device unplugged, backend error) is replaced on next use.
//!
//! Each entry also carries a monitor tap: an interleaved ring written by
//! the capture callback and drained into the master bus at a per-device
//! gain that defaults to zero (recording does not imply monitoring).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::MixerResult;
use crate::types::{DeviceKey, Sample, StereoFrame};

use super::backend::{
    CaptureBackend, CaptureSinks, CaptureStream, ChunkReceiver, ChunkRouter, InputDevice,
    LevelMeter, MONITOR_RING_CAPACITY,
};

/// Shared per-device monitor gain, written by the UI and read by render
struct MonitorGain {
    bits: AtomicU32,
}

impl MonitorGain {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bits: AtomicU32::new(0),
        })
    }

    fn set(&self, gain: Sample) {
        self.bits.store(gain.max(0.0).to_bits(), Ordering::Relaxed);
    }

    fn get(&self) -> Sample {
        Sample::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

struct PoolEntry {
    stream: Box<dyn CaptureStream>,
    router: Arc<ChunkRouter>,
    level: Arc<LevelMeter>,
    monitor_gain: Arc<MonitorGain>,
    monitor_rx: rtrb::Consumer<Sample>,
}

/// Pool of capture streams keyed by device
pub struct DeviceStreamPool {
    backend: Box<dyn CaptureBackend>,
    entries: HashMap<DeviceKey, PoolEntry>,
}

impl DeviceStreamPool {
    pub fn new(backend: Box<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            entries: HashMap::new(),
        }
    }

    /// Ensure a live stream exists for `key`, opening one if needed.
    /// A monitor gain set on a previous stream for this key survives
    /// replacement.
    pub fn init_stream(&mut self, key: &DeviceKey) -> MixerResult<()> {
        if let Some(entry) = self.entries.get(key) {
            if entry.stream.is_live() {
                return Ok(());
            }
            log::warn!("Capture stream for {} died, reopening", key);
        }

        let gain = self
            .entries
            .remove(key)
            .map(|e| Arc::clone(&e.monitor_gain))
            .unwrap_or_else(MonitorGain::new);

        let router = ChunkRouter::new();
        let level = LevelMeter::new();
        let (monitor_tx, monitor_rx) = rtrb::RingBuffer::new(MONITOR_RING_CAPACITY);

        let stream = self.backend.open(
            key,
            CaptureSinks {
                router: Arc::clone(&router),
                level: Arc::clone(&level),
                monitor: monitor_tx,
            },
        )?;

        self.entries.insert(
            key.clone(),
            PoolEntry {
                stream,
                router,
                level,
                monitor_gain: gain,
                monitor_rx,
            },
        );
        Ok(())
    }

    /// Open a chunk subscription on the device, starting its stream first
    /// if necessary
    pub fn subscribe(&mut self, key: &DeviceKey) -> MixerResult<ChunkReceiver> {
        self.init_stream(key)?;
        // init_stream guarantees the entry exists
        let entry = &self.entries[key];
        Ok(entry.router.subscribe())
    }

    /// Capture sample rate of the device's live stream
    pub fn stream_sample_rate(&self, key: &DeviceKey) -> Option<u32> {
        self.entries.get(key).map(|e| e.stream.sample_rate())
    }

    pub fn has_live_stream(&self, key: &DeviceKey) -> bool {
        self.entries
            .get(key)
            .map(|e| e.stream.is_live())
            .unwrap_or(false)
    }

    /// Peak input level of the most recent capture chunk, if the device
    /// has a stream
    pub fn input_level(&self, key: &DeviceKey) -> Option<Sample> {
        self.entries.get(key).map(|e| e.level.peak())
    }

    /// Set the monitor pass-through gain for a device (0.0 = muted)
    pub fn set_monitor_volume(&mut self, key: &DeviceKey, gain: Sample) {
        if let Some(entry) = self.entries.get(key) {
            entry.monitor_gain.set(gain);
        } else {
            log::warn!("set_monitor_volume: no stream for {}", key);
        }
    }

    pub fn monitor_volume(&self, key: &DeviceKey) -> Option<Sample> {
        self.entries.get(key).map(|e| e.monitor_gain.get())
    }

    /// Drain one render quantum from every device's monitor ring into the
    /// master bus.
    ///
    /// Device callbacks deliver chunks larger than a quantum, so samples
    /// routinely wait in the ring across calls; the ring's capacity bounds
    /// that backlog and the callback drops on overflow. Rings are popped
    /// even at zero gain, so a muted monitor stays caught up instead of
    /// replaying old audio when unmuted.
    pub fn mix_monitors(&mut self, output: &mut [StereoFrame]) {
        for entry in self.entries.values_mut() {
            let gain = entry.monitor_gain.get();
            for frame in output.iter_mut() {
                let (Ok(l), Ok(r)) = (entry.monitor_rx.pop(), entry.monitor_rx.pop()) else {
                    break;
                };
                if gain > 0.0 {
                    frame.left += l * gain;
                    frame.right += r * gain;
                }
            }
        }
    }

    /// Backend latency estimate used when calibration found nothing
    pub fn reported_latency(&self) -> f64 {
        self.backend.reported_latency()
    }

    /// Enumerate input devices through the backend
    pub fn input_devices(&self) -> MixerResult<Vec<InputDevice>> {
        self.backend.input_devices()
    }

    /// Drop every stream, releasing the devices
    pub fn teardown(&mut self) {
        if !self.entries.is_empty() {
            log::info!("Tearing down {} capture stream(s)", self.entries.len());
        }
        self.entries.clear();
    }

    pub fn open_count(&self) -> usize {
        self.entries.len()
    }
}
