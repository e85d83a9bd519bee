//! Demuxer interface. A demuxer parses the container format and produces
//! tagged packets into the engine's three FIFOs from its own producer
//! thread.

use std::sync::Arc;

use anyhow::Result;

use crate::{buffer::PacketFifo, input::InputSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    Accept,
    Reject,
}

/// Probing stage hint: sniff the content first, fall back to the mrl
/// extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeHint {
    Content,
    Extension,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DemuxStatus {
    Ok,
    Finished,
}

/// The three packet queues a demuxer produces into.
#[derive(Clone)]
pub struct DemuxOutputs {
    pub video: PacketFifo,
    pub audio: PacketFifo,
    pub spu: PacketFifo,
}

/// Engine callbacks a demuxer may invoke at the end of the stream.
#[derive(Default)]
pub struct DemuxCallbacks {
    /// Playlist-style sources: ask for the mrl to continue with.
    pub next_mrl: Option<Box<dyn Fn() -> Option<String> + Send + Sync>>,
    /// The stream branched (dvd angle change and friends).
    pub branched: Option<Box<dyn Fn() + Send + Sync>>,
}

pub trait Demuxer: Send + Sync {
    fn identifier(&self) -> &'static str;

    fn probe(&self, input: &Arc<dyn InputSource>, hint: ProbeHint) -> ProbeResult;

    /// Start producing packets from `pos` (byte offset) or `start_time_ms`.
    /// Returns once the producer thread is running.
    fn start(
        &self,
        input: Arc<dyn InputSource>,
        outputs: DemuxOutputs,
        pos: u64,
        start_time_ms: u64,
        callbacks: DemuxCallbacks,
    ) -> Result<()>;

    fn stop(&self);

    fn status(&self) -> DemuxStatus;

    fn stream_length_ms(&self) -> u64 {
        0
    }
}
