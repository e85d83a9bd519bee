//! Video decoder worker: one thread pulling the video FIFO, dispatching to
//! the registered decoder and drawing frames into the output stage.

use std::{collections::HashSet, sync::Arc, thread::JoinHandle};

use kinema_util::position::PositionTracker;
use tracing::{debug, info, warn};

use crate::{
    buffer::{Control, Packet, PacketBody, PacketFifo, StreamClass, StreamTag},
    decoder::{DecodeOutcome, DecoderRegistry, StreamFlags, VideoDecoder},
    events::{Event, EventBus},
    metronom::{DiscontinuityKind, Metronom},
    video_out::VideoOutput,
};

pub struct VideoWorkerContext {
    pub fifo: PacketFifo,
    pub registry: Arc<DecoderRegistry<dyn VideoDecoder>>,
    pub metronom: Arc<Metronom>,
    pub output: VideoOutput,
    pub events: EventBus,
    pub flags: Arc<StreamFlags>,
    pub position: Arc<PositionTracker>,
}

pub fn spawn(ctx: VideoWorkerContext) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("video-decoder".into())
        .spawn(move || worker_loop(ctx))
        .expect("failed to spawn video decoder thread")
}

struct ActiveDecoder {
    family: u8,
    tag: StreamTag,
    decoder: Box<dyn VideoDecoder>,
}

fn close_current(current: &mut Option<ActiveDecoder>) {
    if let Some(mut active) = current.take() {
        debug!(codec = active.decoder.identifier(), "closing video decoder");
        active.decoder.close();
    }
}

fn worker_loop(ctx: VideoWorkerContext) {
    let mut current: Option<ActiveDecoder> = None;
    // One diagnostic per distinct unhandled kind per track.
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
                    unknown.clear();
                    failed.clear();
                    ctx.flags.reset_video();
                    ctx.metronom
                        .handle_video_discontinuity(DiscontinuityKind::StreamStart, 0);
                }
                Control::End { .. } => {
                    close_current(&mut current);
                    if ctx.flags.finish_video() {
                        ctx.events.send(Event::StreamFinished);
                    }
                }
                Control::Quit => {
                    close_current(&mut current);
                    debug!("video decoder quitting");
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
                    ctx.metronom.handle_video_discontinuity(kind, offset);
                }
                Control::Discontinuity { offset } => {
                    ctx.metronom
                        .handle_video_discontinuity(DiscontinuityKind::Relative, offset);
                }
                Control::AudioChannel { .. } | Control::SpuChannel { .. } => {
                    ctx.events.send(Event::ChannelsChanged);
                }
                Control::HeadersDone | Control::Nop => {}
            },
            PacketBody::Data { tag } => {
                dispatch(&ctx, &packet, tag, &mut current, &mut unknown, &mut failed);
            }
        }
        // Dropping the packet returns its slot to the fifo pool.
    }
}

fn dispatch(
    ctx: &VideoWorkerContext,
    packet: &Packet,
    tag: StreamTag,
    current: &mut Option<ActiveDecoder>,
    unknown: &mut HashSet<u32>,
    failed: &mut HashSet<u32>,
) {
    if tag.class() != Some(StreamClass::Video) {
        if unknown.insert(tag.0) {
            warn!(?tag, "unexpected packet class on video fifo");
        }
        return;
    }
    if failed.contains(&tag.0) {
        return;
    }

    let family = tag.family();
    if current.as_ref().map(|a| a.family) != Some(family) {
        let old = current.as_ref().map(|a| a.tag.0);
        match ctx.registry.instantiate(family) {
            Some(mut decoder) => {
                close_current(current);
                match decoder.init(ctx.output.clone()) {
                    Ok(()) => {
                        info!(codec = decoder.identifier(), "video decoder initialized");
                        ctx.events.send(Event::CodecChanged {
                            class: StreamClass::Video,
                            old,
                            new: Some(tag.0),
                            handled: true,
                        });
                        *current = Some(ActiveDecoder {
                            family,
                            tag,
                            decoder,
                        });
                    }
                    Err(e) => {
                        warn!(%e, ?tag, "video decoder init failed, muting kind");
                        ctx.events.send(Event::CodecChanged {
                            class: StreamClass::Video,
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
                    warn!(?tag, "no video decoder available for kind");
                    ctx.events.send(Event::CodecChanged {
                        class: StreamClass::Video,
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
            debug!("video decoder requested reset");
            if let Some(active) = current.as_mut() {
                active.decoder.reset();
            }
        }
        Some(DecodeOutcome::Fatal) => {
            warn!(?tag, "video decoder fatal error, closing track");
            close_current(current);
            failed.insert(tag.0);
            ctx.flags.finish_video();
            ctx.events.send(Event::StreamFinished);
        }
    }
}
