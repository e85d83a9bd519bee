//! kinema-core: the playback pipeline engine.
//!
//! Turns a demultiplexed stream of timestamped packets into synchronized
//! video frames, audio samples and subtitle overlays on the output drivers.
//! Inputs, demuxers, codecs and the platform drivers are supplied by the
//! embedder through the trait seams in [`input`], [`demux`], [`decoder`],
//! [`video_out`] and [`audio_out`].

#![allow(clippy::too_many_arguments)]

pub mod audio_out;
pub mod buffer;
pub mod config;
pub mod decoder;
pub mod demux;
pub mod engine;
pub mod events;
pub mod input;
pub mod metronom;
pub mod overlay;
pub mod video_out;


pub use audio_out::{AudioBuffer, AudioDriver, AudioMode, AudioOutput};
pub use buffer::{Control, DecoderFlags, Packet, PacketBody, PacketFifo, StreamClass, StreamTag};
pub use config::{ConfigStore, ConfigValue, Registration};
pub use decoder::{
    AudioDecoder, DecodeOutcome, DecoderRegistry, SpuDecoder, SpuSink, VideoDecoder,
};
pub use demux::{DemuxCallbacks, DemuxOutputs, DemuxStatus, Demuxer, ProbeHint, ProbeResult};
pub use engine::{Engine, EngineStatus};
pub use events::{Event, EventBus, EventQueue, QueuedEvent, UiEvent};
pub use input::{InputEventKind, InputSource};
pub use metronom::{DiscontinuityKind, Metronom, ScrProvider, Speed, StrictScr, SystemScr};
pub use overlay::{Overlay, OverlayBuffer, OverlayColor, OverlaySource, RleSpan};
pub use video_out::{
    AspectCode, DriverCaps, DriverEvent, DriverProperty, Frame, FrameData, FrameFlags,
    FrameFormat, FrameStats, VideoDriver, VideoOutput,
};

pub fn init() {
    kinema_util::log::init();
}
