//! Audio output stage: wraps the platform audio driver and stamps sample
//! blocks with their VPTS on the way out.
//!
//! A failed device open mutes audio for the remainder of the track; the
//! decoder keeps producing and the stage keeps consuming, so the video path
//! is unaffected.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering::Relaxed},
    Arc,
};

use anyhow::Result;
use tracing::{debug, warn};

use crate::metronom::{Metronom, AUDIO_SAMPLE_NUM, PTS_PER_SECOND};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioMode {
    Mono,
    Stereo,
    FiveOne,
}

/// A block of interleaved samples on its way to the device.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    pub samples: Vec<i16>,
    /// Sample frames in this block (pairs for stereo).
    pub nsamples: usize,
    /// Source PTS of the first sample, 0 when unknown.
    pub pts: i64,
    /// Filled in by the output stage before the driver sees the block.
    pub vpts: i64,
}

pub trait AudioDriver: Send + Sync {
    fn open(&self, bits: u32, rate: u32, mode: AudioMode) -> Result<()>;

    fn get_buffer(&self) -> AudioBuffer {
        AudioBuffer::default()
    }

    /// May block up to the device's buffer period.
    fn put_buffer(&self, buffer: AudioBuffer) -> Result<()>;

    fn close(&self);
}

struct AudioOutShared {
    driver: Option<Box<dyn AudioDriver>>,
    metronom: Arc<Metronom>,
    device_open: AtomicBool,
    /// Device open failed; swallow everything for this track.
    track_muted: AtomicBool,
    /// 0 = audible, 1 = trick-speed soft mute, 2 = paused.
    mute_level: AtomicU32,
}

/// Cheap-to-clone handle; the audio decoder writes through its clone.
#[derive(Clone)]
pub struct AudioOutput {
    shared: Arc<AudioOutShared>,
}

impl AudioOutput {
    pub fn new(driver: Option<Box<dyn AudioDriver>>, metronom: Arc<Metronom>) -> AudioOutput {
        AudioOutput {
            shared: Arc::new(AudioOutShared {
                driver,
                metronom,
                device_open: AtomicBool::new(false),
                track_muted: AtomicBool::new(false),
                mute_level: AtomicU32::new(0),
            }),
        }
    }

    /// Whether an audio driver exists at all.
    pub fn enabled(&self) -> bool {
        self.shared.driver.is_some()
    }

    /// Open the device. On failure the track is muted and `false` returned;
    /// the caller continues decoding regardless.
    pub fn open(&self, bits: u32, rate: u32, mode: AudioMode) -> bool {
        let Some(driver) = &self.shared.driver else {
            return false;
        };
        self.shared
            .metronom
            .set_audio_rate(PTS_PER_SECOND * AUDIO_SAMPLE_NUM / rate.max(1) as i64);
        match driver.open(bits, rate, mode) {
            Ok(()) => {
                debug!(bits, rate, ?mode, "audio device opened");
                self.shared.device_open.store(true, Relaxed);
                self.shared.track_muted.store(false, Relaxed);
                true
            }
            Err(e) => {
                warn!(%e, "audio device open failed, muting track");
                self.shared.device_open.store(false, Relaxed);
                self.shared.track_muted.store(true, Relaxed);
                false
            }
        }
    }

    pub fn get_buffer(&self) -> AudioBuffer {
        match &self.shared.driver {
            Some(driver) => driver.get_buffer(),
            None => AudioBuffer::default(),
        }
    }

    /// Stamp the block with its VPTS and hand it to the device. The VPTS is
    /// computed even while muted so the audio clock keeps advancing.
    pub fn put_buffer(&self, mut buffer: AudioBuffer) -> i64 {
        let vpts = self
            .shared
            .metronom
            .got_audio_samples(buffer.pts, buffer.nsamples as i64);
        buffer.vpts = vpts;

        let audible = self.shared.device_open.load(Relaxed)
            && !self.shared.track_muted.load(Relaxed)
            && self.shared.mute_level.load(Relaxed) == 0;
        if audible {
            if let Some(driver) = &self.shared.driver {
                if let Err(e) = driver.put_buffer(buffer) {
                    warn!(%e, "audio device write failed");
                }
            }
        }
        vpts
    }

    /// 0 = audible, 1 = trick-speed soft mute, 2 = paused.
    pub fn set_mute_level(&self, level: u32) {
        self.shared.mute_level.store(level, Relaxed);
    }

    pub fn mute_level(&self) -> u32 {
        self.shared.mute_level.load(Relaxed)
    }

    pub fn track_muted(&self) -> bool {
        self.shared.track_muted.load(Relaxed)
    }

    pub fn close(&self) {
        if self.shared.device_open.swap(false, Relaxed) {
            if let Some(driver) = &self.shared.driver {
                driver.close();
            }
        }
    }
}
