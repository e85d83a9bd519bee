//! Subpicture decoder worker: same shape as the video worker, but output
//! goes into the overlay buffer the display loop consults during blending.

use std::{collections::HashSet, sync::Arc, thread::JoinHandle};

use kinema_util::position::PositionTracker;
use tracing::{debug, info, warn};

use crate::{
    buffer::{Control, Packet, PacketBody, PacketFifo, StreamClass, StreamTag},
    decoder::{ChannelState, DecodeOutcome, DecoderRegistry, SpuDecoder, SpuSink},
    events::{Event, EventBus},
};

pub struct SpuWorkerContext {
    pub fifo: PacketFifo,
    pub registry: Arc<DecoderRegistry<dyn SpuDecoder>>,
    pub sink: SpuSink,
    pub events: EventBus,
    pub position: Arc<PositionTracker>,
    pub channels: Arc<ChannelState>,
}

pub fn spawn(ctx: SpuWorkerContext) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("spu-decoder".into())
        .spawn(move || worker_loop(ctx))
        .expect("failed to spawn spu decoder thread")
}

struct ActiveDecoder {
    family: u8,
    tag: StreamTag,
    decoder: Box<dyn SpuDecoder>,
}

fn close_current(current: &mut Option<ActiveDecoder>) {
    if let Some(mut active) = current.take() {
        debug!(codec = active.decoder.identifier(), "closing spu decoder");
        active.decoder.close();
    }
}

fn worker_loop(ctx: SpuWorkerContext) {
    let mut current: Option<ActiveDecoder> = None;
    let mut unknown: HashSet<u32> = HashSet::new();

    loop {
        let packet = ctx.fifo.get();
        if packet.input_pos != 0 {
            ctx.position.record_pos(packet.input_pos);
        }

        match packet.body.clone() {
            PacketBody::Control(control) => match control {
                Control::Start => {
                    close_current(&mut current);
                    unknown.clear();
                }
                Control::End { .. } => {
                    close_current(&mut current);
                }
                Control::Quit => {
                    close_current(&mut current);
                    debug!("spu decoder quitting");
                    return;
                }
                Control::ResetDecoder => {
                    if let Some(active) = current.as_mut() {
                        active.decoder.reset();
                    }
                }
                Control::SpuChannel { channel } => {
                    info!(channel, "spu channel selected");
                    ctx.channels
                        .spu
                        .store(channel, std::sync::atomic::Ordering::Relaxed);
                    close_current(&mut current);
                    ctx.events.send(Event::ChannelsChanged);
                }
                // The timeline announcements are handled by the video and
                // audio workers; subpictures have no wrap state of their own.
                Control::Newpts { .. }
                | Control::Discontinuity { .. }
                | Control::AudioChannel { .. }
                | Control::HeadersDone
                | Control::Nop => {}
            },
            PacketBody::Data { tag } => {
                dispatch(&ctx, &packet, tag, &mut current, &mut unknown);
            }
        }
    }
}

fn dispatch(
    ctx: &SpuWorkerContext,
    packet: &Packet,
    tag: StreamTag,
    current: &mut Option<ActiveDecoder>,
    unknown: &mut HashSet<u32>,
) {
    if tag.class() != Some(StreamClass::Spu) {
        if unknown.insert(tag.0) {
            warn!(?tag, "unexpected packet class on spu fifo");
        }
        return;
    }

    let selected = ctx.channels.spu.load(std::sync::atomic::Ordering::Relaxed);
    // -1 switches subtitles off entirely.
    if selected < 0 || tag.index() as i32 != selected {
        return;
    }

    let family = tag.family();
    if current.as_ref().map(|a| a.family) != Some(family) {
        let old = current.as_ref().map(|a| a.tag.0);
        match ctx.registry.instantiate(family) {
            Some(mut decoder) => {
                close_current(current);
                match decoder.init(ctx.sink.clone()) {
                    Ok(()) => {
                        info!(codec = decoder.identifier(), "spu decoder initialized");
                        ctx.events.send(Event::CodecChanged {
                            class: StreamClass::Spu,
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
                        warn!(%e, ?tag, "spu decoder init failed");
                        ctx.events.send(Event::CodecChanged {
                            class: StreamClass::Spu,
                            old,
                            new: Some(tag.0),
                            handled: false,
                        });
                    }
                }
            }
            None => {
                if unknown.insert(tag.0) {
                    warn!(?tag, "no spu decoder available for kind");
                    ctx.events.send(Event::CodecChanged {
                        class: StreamClass::Spu,
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
            if let Some(active) = current.as_mut() {
                active.decoder.reset();
            }
        }
        Some(DecodeOutcome::Fatal) => {
            warn!(?tag, "spu decoder fatal error, dropping decoder");
            close_current(current);
        }
    }
}
