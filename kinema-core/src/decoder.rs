//! Decoder traits, the per-class registries and state shared between the
//! decoder workers.
//!
//! A registry maps a codec family byte to a factory; the worker instantiates
//! a decoder when the stream's family changes, gives it the matching output
//! sink and closes it when the next family (or the end of the stream)
//! arrives. Codec implementations live with the embedder.

pub mod audio;
pub mod spu;
pub mod video;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering::Relaxed},
        Arc, Mutex,
    },
};

use anyhow::Result;
use tracing::trace;

use crate::{
    audio_out::AudioOutput,
    buffer::Packet,
    metronom::Metronom,
    overlay::{Overlay, OverlayBuffer},
    video_out::VideoOutput,
};

/// What a decoder made of one packet. The workers translate outcomes into
/// the pipeline's error policy: everything short of `Fatal` stays local to
/// the packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Packet consumed (possibly producing output).
    Consumed,
    /// Packet dropped; the next FRAME_END resynchronizes.
    Skipped,
    /// Decoder state is broken, `reset` it and continue.
    NeedReset,
    /// The track cannot continue (frame allocation failed and friends).
    Fatal,
}

pub trait VideoDecoder: Send {
    fn identifier(&self) -> &'static str;

    fn init(&mut self, output: VideoOutput) -> Result<()>;

    fn decode(&mut self, packet: &Packet) -> DecodeOutcome;

    fn reset(&mut self);

    fn close(&mut self);
}

pub trait AudioDecoder: Send {
    fn identifier(&self) -> &'static str;

    fn init(&mut self, output: AudioOutput) -> Result<()>;

    fn decode(&mut self, packet: &Packet) -> DecodeOutcome;

    fn reset(&mut self);

    fn close(&mut self);
}

pub trait SpuDecoder: Send {
    fn identifier(&self) -> &'static str;

    fn init(&mut self, sink: SpuSink) -> Result<()>;

    fn decode(&mut self, packet: &Packet) -> DecodeOutcome;

    fn reset(&mut self);

    fn close(&mut self);
}

type Factory<T> = Arc<dyn Fn() -> Box<T> + Send + Sync>;

/// Family byte -> decoder factory. Registration happens at engine startup;
/// lookups are pure.
pub struct DecoderRegistry<T: ?Sized> {
    factories: Mutex<HashMap<u8, Factory<T>>>,
}

impl<T: ?Sized> DecoderRegistry<T> {
    pub fn new() -> DecoderRegistry<T> {
        DecoderRegistry {
            factories: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, family: u8, factory: impl Fn() -> Box<T> + Send + Sync + 'static) {
        self.factories.lock().unwrap().insert(family, Arc::new(factory));
    }

    pub fn unregister(&self, family: u8) {
        self.factories.lock().unwrap().remove(&family);
    }

    pub fn contains(&self, family: u8) -> bool {
        self.factories.lock().unwrap().contains_key(&family)
    }

    pub fn instantiate(&self, family: u8) -> Option<Box<T>> {
        let factory = self.factories.lock().unwrap().get(&family).cloned();
        factory.map(|f| f())
    }
}

impl<T: ?Sized> Default for DecoderRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a subpicture decoder delivers its overlays: the VPTS stamping and
/// the interval buffer the display loop consults.
#[derive(Clone)]
pub struct SpuSink {
    metronom: Arc<Metronom>,
    buffer: Arc<OverlayBuffer>,
}

impl SpuSink {
    pub fn new(metronom: Arc<Metronom>, buffer: Arc<OverlayBuffer>) -> SpuSink {
        SpuSink { metronom, buffer }
    }

    /// Stamp the overlay with its VPTS and queue it. Returns false when the
    /// metronom cannot place it (discontinuity window) and it was dropped.
    pub fn submit(&self, pts: i64, mut overlay: Overlay) -> bool {
        let vpts = self.metronom.got_spu_packet(pts);
        if vpts == 0 {
            trace!(pts, "overlay dropped inside discontinuity window");
            return false;
        }
        overlay.vpts = vpts;
        self.buffer.submit(overlay);
        true
    }

    pub fn metronom(&self) -> &Arc<Metronom> {
        &self.metronom
    }
}

/// Finished flags shared between the video and audio workers: the
/// `StreamFinished` event fires when the last of the pair finishes.
pub struct StreamFlags {
    video_finished: AtomicBool,
    audio_finished: AtomicBool,
    have_audio: bool,
}

impl StreamFlags {
    pub fn new(have_audio: bool) -> StreamFlags {
        StreamFlags {
            video_finished: AtomicBool::new(false),
            audio_finished: AtomicBool::new(!have_audio),
            have_audio,
        }
    }

    pub fn reset_video(&self) {
        self.video_finished.store(false, Relaxed);
    }

    pub fn reset_audio(&self) {
        if self.have_audio {
            self.audio_finished.store(false, Relaxed);
        }
    }

    /// Mark the video side finished; true when the audio side already is.
    pub fn finish_video(&self) -> bool {
        self.video_finished.store(true, Relaxed);
        self.audio_finished.load(Relaxed)
    }

    /// Mark the audio side finished; true when the video side already is.
    pub fn finish_audio(&self) -> bool {
        self.audio_finished.store(true, Relaxed);
        self.video_finished.load(Relaxed)
    }

    pub fn video_finished(&self) -> bool {
        self.video_finished.load(Relaxed)
    }

    pub fn audio_finished(&self) -> bool {
        self.audio_finished.load(Relaxed)
    }
}

/// Channel selection shared between the facade and the workers. The value
/// becomes effective when the worker processes the in-band channel control
/// packet, keeping the switch ordered with the data around it.
pub struct ChannelState {
    pub audio: AtomicI32,
    pub spu: AtomicI32,
}

impl ChannelState {
    pub fn new() -> ChannelState {
        ChannelState {
            audio: AtomicI32::new(0),
            spu: AtomicI32::new(-1),
        }
    }
}

impl Default for ChannelState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_round_trip() {
        struct Null;
        impl VideoDecoder for Null {
            fn identifier(&self) -> &'static str {
                "null"
            }
            fn init(&mut self, _output: VideoOutput) -> Result<()> {
                Ok(())
            }
            fn decode(&mut self, _packet: &Packet) -> DecodeOutcome {
                DecodeOutcome::Skipped
            }
            fn reset(&mut self) {}
            fn close(&mut self) {}
        }

        let registry: DecoderRegistry<dyn VideoDecoder> = DecoderRegistry::new();
        assert!(registry.instantiate(1).is_none());
        registry.register(1, || Box::new(Null));
        assert!(registry.contains(1));
        let decoder = registry.instantiate(1).unwrap();
        assert_eq!(decoder.identifier(), "null");
        registry.unregister(1);
        assert!(!registry.contains(1));
    }

    #[test]
    fn test_stream_flags_pairing() {
        let flags = StreamFlags::new(true);
        assert!(!flags.finish_video());
        assert!(flags.finish_audio());

        let flags = StreamFlags::new(false);
        // No audio stream: the audio side counts as always finished.
        assert!(flags.finish_video());
    }

    #[test]
    fn test_spu_sink_stamps_vpts() {
        kinema_util::log::init();
        let metronom = Metronom::new(false);
        let buffer = Arc::new(OverlayBuffer::new());
        let sink = SpuSink::new(metronom.clone(), buffer.clone());

        let overlay = Overlay {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
            colors: [crate::overlay::OverlayColor { y: 0, u: 0, v: 0 }; 4],
            alpha: [255; 4],
            rle: vec![],
            vpts: 0,
            duration: 1000,
        };
        assert!(sink.submit(5000, overlay));
        use crate::overlay::OverlaySource;
        let stored = buffer
            .get_overlay(5000 + crate::metronom::PREBUFFER_PTS_OFFSET)
            .unwrap();
        assert_eq!(stored.vpts, 5000 + crate::metronom::PREBUFFER_PTS_OFFSET);
        metronom.shutdown();
    }
}
