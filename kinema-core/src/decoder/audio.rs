//! Audio decoder worker.
//!
//! Besides the control/dispatch loop it maintains the track map: the sorted
//! list of distinct audio kinds seen in the stream, giving the UI stable
//! logical channel numbers. Only the selected channel's packets reach the
//! decoder; the rest are released undecoded.

use std::{collections::HashSet, sync::Arc, thread::JoinHandle};

use kinema_util::position::PositionTracker;
use tracing::{debug, info, warn};

use crate::{
    audio_out::AudioOutput,
    buffer::{Control, Packet, PacketBody, PacketFifo, StreamClass, StreamTag},
    decoder::{AudioDecoder, ChannelState, DecodeOutcome, DecoderRegistry, StreamFlags},
    events::{Event, EventBus},
    metronom::{DiscontinuityKind, Metronom},
};

pub struct AudioWorkerContext {
    pub fifo: PacketFifo,
    pub registry: Arc<DecoderRegistry<dyn AudioDecoder>>,
    pub metronom: Arc<Metronom>,
    pub output: AudioOutput,
    pub events: EventBus,
    pub flags: Arc<StreamFlags>,
    pub position: Arc<PositionTracker>,
    pub channels: Arc<ChannelState>,
}

pub fn spawn(ctx: AudioWorkerContext) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("audio-decoder".into())
        .spawn(move || worker_loop(ctx))
        .expect("failed to spawn audio decoder thread")
}

struct ActiveDecoder {
    tag: StreamTag,
    decoder: Box<dyn AudioDecoder>,
}

fn close_current(current: &mut Option<ActiveDecoder>) {
    if let Some(mut active) = current.take() {
        debug!(codec = active.decoder.identifier(), "closing audio decoder");
        active.decoder.close();
    }
}

fn worker_loop(ctx: AudioWorkerContext) {
    let mut current: Option<ActiveDecoder> = None;
    let mut track_map: Vec<StreamTag> = Vec::new();
    let mut unknown: HashSet<u32> = HashSet::new();
    let mut failed: HashSet<u32> = HashSet::new();

    loop {
        let packet = ctx.fifo.get();
        if packet.input_pos != 0 {
            ctx.position.record_pos(packet.input_pos);
        }
        if packet.input_time_ms != 0 {
            ctx.position.record_millis(packet.input_time_ms);
        }

        match packet.body.clone() {
            PacketBody::Control(control) => match control {
                Control::Start => {
                    close_current(&mut current);
                    track_map.clear();
                    unknown.clear();
                    failed.clear();
                    ctx.flags.reset_audio();
                    ctx.metronom
                        .handle_audio_discontinuity(DiscontinuityKind::StreamStart, 0);
                }
                Control::End { .. } => {
                    close_current(&mut current);
                    if ctx.flags.finish_audio() {
                        ctx.events.send(Event::StreamFinished);
                    }
                }
                Control::Quit => {
                    close_current(&mut current);
                    ctx.output.close();
                    debug!("audio decoder quitting");
                    return;
                }
                Control::ResetDecoder => {
                    if let Some(active) = current.as_mut() {
                        active.decoder.reset();
                    }
                }
                Control::Newpts { offset, seek } => {
                    let kind = if seek {
                        DiscontinuityKind::StreamSeek
                    } else {
                        DiscontinuityKind::Absolute
                    };
                    ctx.metronom.handle_audio_discontinuity(kind, offset);
                }
                Control::Discontinuity { offset } => {
                    ctx.metronom
                        .handle_audio_discontinuity(DiscontinuityKind::Relative, offset);
                }
                Control::AudioChannel { channel } => {
                    info!(channel, "audio channel selected");
                    ctx.channels.audio.store(channel, std::sync::atomic::Ordering::Relaxed);
                    // Fresh init on the next packet of the new channel.
                    close_current(&mut current);
                    ctx.events.send(Event::ChannelsChanged);
                }
                Control::SpuChannel { .. } | Control::HeadersDone | Control::Nop => {}
            },
            PacketBody::Data { tag } => {
                dispatch(
                    &ctx,
                    &packet,
                    tag,
                    &mut current,
                    &mut track_map,
                    &mut unknown,
                    &mut failed,
                );
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    ctx: &AudioWorkerContext,
    packet: &Packet,
    tag: StreamTag,
    current: &mut Option<ActiveDecoder>,
    track_map: &mut Vec<StreamTag>,
    unknown: &mut HashSet<u32>,
    failed: &mut HashSet<u32>,
) {
    if tag.class() != Some(StreamClass::Audio) {
        if unknown.insert(tag.0) {
            warn!(?tag, "unexpected packet class on audio fifo");
        }
        return;
    }
    if !ctx.output.enabled() {
        return;
    }

    let selected = ctx
        .channels
        .audio
        .load(std::sync::atomic::Ordering::Relaxed)
        .max(0) as usize;

    // Track map upkeep: newly observed kinds are inserted sorted. An insert
    // at or before the selected index shifts the channel numbering, so the
    // current decoder is closed and reopened for the packet that now owns
    // the selected slot.
    if let Err(insert_at) = track_map.binary_search(&tag) {
        debug!(?tag, insert_at, "new audio track observed");
        track_map.insert(insert_at, tag);
        if insert_at <= selected {
            debug!("track numbering shifted, resetting audio decoder");
            close_current(current);
        }
    }

    if track_map.get(selected) != Some(&tag) {
        return;
    }
    if failed.contains(&tag.0) {
        return;
    }

    if current.as_ref().map(|a| a.tag) != Some(tag) {
        let old = current.as_ref().map(|a| a.tag.0);
        match ctx.registry.instantiate(tag.family()) {
            Some(mut decoder) => {
                close_current(current);
                match decoder.init(ctx.output.clone()) {
                    Ok(()) => {
                        info!(codec = decoder.identifier(), "audio decoder initialized");
                        ctx.events.send(Event::CodecChanged {
                            class: StreamClass::Audio,
                            old,
                            new: Some(tag.0),
                            handled: true,
                        });
                        *current = Some(ActiveDecoder { tag, decoder });
                    }
                    Err(e) => {
                        warn!(%e, ?tag, "audio decoder init failed, muting kind");
                        ctx.events.send(Event::CodecChanged {
                            class: StreamClass::Audio,
                            old,
                            new: Some(tag.0),
                            handled: false,
                        });
                        failed.insert(tag.0);
                    }
                }
            }
            None => {
                if unknown.insert(tag.0) {
                    warn!(?tag, "no audio decoder available for kind");
                    ctx.events.send(Event::CodecChanged {
                        class: StreamClass::Audio,
                        old,
                        new: Some(tag.0),
                        handled: false,
                    });
                }
                return;
            }
        }
    }

    let outcome = current
        .as_mut()
        .map(|active| active.decoder.decode(packet));
    match outcome {
        None | Some(DecodeOutcome::Consumed) | Some(DecodeOutcome::Skipped) => {}
        Some(DecodeOutcome::NeedReset) => {
            debug!("audio decoder requested reset");
            if let Some(active) = current.as_mut() {
                active.decoder.reset();
            }
        }
        Some(DecodeOutcome::Fatal) => {
            warn!(?tag, "audio decoder fatal error, closing track");
            close_current(current);
            failed.insert(tag.0);
            ctx.flags.finish_audio();
            ctx.events.send(Event::StreamFinished);
        }
    }
}
