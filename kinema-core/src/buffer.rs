//! Typed packet FIFOs between the demuxer and the decoder workers.
//!
//! Every stream class (video, audio, subpicture) gets its own bounded FIFO.
//! A FIFO owns a fixed set of payload slots; producers block in [`PacketFifo::acquire`]
//! when all slots are in flight, which is the engine's only backpressure
//! mechanism. Control messages travel in-band through the same queues so that
//! decoder state transitions stay ordered with the surrounding data.

use std::{
    collections::VecDeque,
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Condvar, Mutex, Weak},
};

/// The video FIFO holds roughly 2 seconds of demuxed data at typical rates.
pub const VIDEO_FIFO_SLOTS: usize = 500;
pub const VIDEO_FIFO_SLOT_SIZE: usize = 8192;
pub const AUDIO_FIFO_SLOTS: usize = 1500;
pub const AUDIO_FIFO_SLOT_SIZE: usize = 4096;
pub const SPU_FIFO_SLOTS: usize = 1500;
pub const SPU_FIFO_SLOT_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum StreamClass {
    Audio,
    Video,
    Spu,
}

/// Wire-visible identity of a data packet.
///
/// Layout: `0xCCFFIIII` where `CC` is the stream class (0x02 audio, 0x03
/// video, 0x04 subpicture), `FF` the codec family and `IIII` the stream
/// index inside the container.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamTag(pub u32);

impl StreamTag {
    pub const AUDIO_BASE: u32 = 0x0200_0000;
    pub const VIDEO_BASE: u32 = 0x0300_0000;
    pub const SPU_BASE: u32 = 0x0400_0000;

    pub const AUDIO_MPEG: StreamTag = StreamTag(Self::AUDIO_BASE);
    pub const AUDIO_AC3: StreamTag = StreamTag(Self::AUDIO_BASE | 0x0001_0000);
    pub const AUDIO_LPCM: StreamTag = StreamTag(Self::AUDIO_BASE | 0x0002_0000);
    pub const AUDIO_WMA: StreamTag = StreamTag(Self::AUDIO_BASE | 0x0003_0000);
    pub const AUDIO_FLAC: StreamTag = StreamTag(Self::AUDIO_BASE | 0x0004_0000);
    pub const AUDIO_ADPCM: StreamTag = StreamTag(Self::AUDIO_BASE | 0x0005_0000);

    pub const VIDEO_MPEG: StreamTag = StreamTag(Self::VIDEO_BASE);
    pub const VIDEO_MPEG4: StreamTag = StreamTag(Self::VIDEO_BASE | 0x0001_0000);
    pub const VIDEO_H263: StreamTag = StreamTag(Self::VIDEO_BASE | 0x0002_0000);
    pub const VIDEO_H264: StreamTag = StreamTag(Self::VIDEO_BASE | 0x0003_0000);
    pub const VIDEO_DV: StreamTag = StreamTag(Self::VIDEO_BASE | 0x0004_0000);
    pub const VIDEO_CINEPAK: StreamTag = StreamTag(Self::VIDEO_BASE | 0x0005_0000);

    pub const SPU_DVD: StreamTag = StreamTag(Self::SPU_BASE);
    pub const SPU_DVB: StreamTag = StreamTag(Self::SPU_BASE | 0x0001_0000);
    pub const SPU_TELETEXT: StreamTag = StreamTag(Self::SPU_BASE | 0x0002_0000);

    pub fn class(self) -> Option<StreamClass> {
        match self.0 >> 24 {
            0x02 => Some(StreamClass::Audio),
            0x03 => Some(StreamClass::Video),
            0x04 => Some(StreamClass::Spu),
            _ => None,
        }
    }

    /// Codec family byte, selects the decoder in the registry.
    pub fn family(self) -> u8 {
        (self.0 >> 16) as u8
    }

    /// Stream index inside the container (substream number).
    pub fn index(self) -> u16 {
        self.0 as u16
    }

    pub fn with_index(self, index: u16) -> StreamTag {
        StreamTag(self.0 & 0xffff_0000 | u32::from(index))
    }
}

impl fmt::Debug for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamTag({:#010x})", self.0)
    }
}

/// Decoder-facing packet flags.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderFlags(pub u32);

impl DecoderFlags {
    pub const HEADER: DecoderFlags = DecoderFlags(0x01);
    pub const FRAME_END: DecoderFlags = DecoderFlags(0x02);
    pub const PREVIEW: DecoderFlags = DecoderFlags(0x04);
    pub const SPECIAL: DecoderFlags = DecoderFlags(0x08);
    pub const STDHEADER: DecoderFlags = DecoderFlags(0x10);
    pub const SEEK: DecoderFlags = DecoderFlags(0x20);
    pub const END_STREAM: DecoderFlags = DecoderFlags(0x40);

    pub fn contains(self, other: DecoderFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: DecoderFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for DecoderFlags {
    type Output = DecoderFlags;

    fn bitor(self, rhs: DecoderFlags) -> DecoderFlags {
        DecoderFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for DecoderFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DecoderFlags({:#04x})", self.0)
    }
}

/// In-band control messages. They synchronize decoder state transitions
/// without a side channel: a control packet is processed strictly after all
/// data enqueued before it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Control {
    Start,
    End { flags: DecoderFlags },
    Quit,
    Newpts { offset: i64, seek: bool },
    Discontinuity { offset: i64 },
    ResetDecoder,
    HeadersDone,
    AudioChannel { channel: i32 },
    SpuChannel { channel: i32 },
    Nop,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PacketBody {
    Control(Control),
    Data { tag: StreamTag },
}

/// One pool slot. Reachable through [`Packet`]'s `Deref` impls.
#[derive(Debug)]
pub struct PacketSlot {
    pub body: PacketBody,
    pub payload: Vec<u8>,
    pub flags: DecoderFlags,
    /// Source PTS in 90 kHz units, 0 when unknown.
    pub pts: i64,
    /// Byte position inside the input source, 0 when unknown.
    pub input_pos: u64,
    /// Wall-clock offset inside the input source in ms, 0 when unknown.
    pub input_time_ms: u64,
    /// Small decoder side channel (sample counts, frame durations, ...).
    pub decoder_info: [u32; 4],
}

impl PacketSlot {
    fn new(slot_size: usize) -> Box<PacketSlot> {
        Box::new(PacketSlot {
            body: PacketBody::Control(Control::Nop),
            payload: Vec::with_capacity(slot_size),
            flags: DecoderFlags::default(),
            pts: 0,
            input_pos: 0,
            input_time_ms: 0,
            decoder_info: [0; 4],
        })
    }

    fn reset(&mut self) {
        self.body = PacketBody::Control(Control::Nop);
        self.payload.clear();
        self.flags = DecoderFlags::default();
        self.pts = 0;
        self.input_pos = 0;
        self.input_time_ms = 0;
        self.decoder_info = [0; 4];
    }
}

/// An owned packet. Dropping it returns the slot to its FIFO's free list, so
/// the slot population is conserved no matter which thread finishes with it.
pub struct Packet {
    slot: Option<Box<PacketSlot>>,
    home: Weak<FifoShared>,
}

impl Packet {
    pub fn set_control(&mut self, control: Control) {
        self.body = PacketBody::Control(control);
    }

    pub fn set_data(&mut self, tag: StreamTag) {
        self.body = PacketBody::Data { tag };
    }

    pub fn data_tag(&self) -> Option<StreamTag> {
        match self.body {
            PacketBody::Data { tag } => Some(tag),
            PacketBody::Control(_) => None,
        }
    }
}

impl Deref for Packet {
    type Target = PacketSlot;

    fn deref(&self) -> &PacketSlot {
        self.slot.as_ref().expect("packet slot taken")
    }
}

impl DerefMut for Packet {
    fn deref_mut(&mut self) -> &mut PacketSlot {
        self.slot.as_mut().expect("packet slot taken")
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(mut slot) = self.slot.take() {
            if let Some(home) = self.home.upgrade() {
                slot.reset();
                home.release(slot);
            }
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("body", &self.body)
            .field("pts", &self.pts)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

struct FifoShared {
    free: Mutex<Vec<Box<PacketSlot>>>,
    free_cond: Condvar,
    queue: Mutex<VecDeque<Packet>>,
    not_empty: Condvar,
    slots: usize,
}

impl FifoShared {
    fn release(&self, slot: Box<PacketSlot>) {
        self.free.lock().unwrap().push(slot);
        self.free_cond.notify_one();
    }
}

/// Bounded ordered packet queue with a built-in slot pool. Clones share the
/// same queue.
#[derive(Clone)]
pub struct PacketFifo {
    shared: Arc<FifoShared>,
}

impl PacketFifo {
    pub fn new(slots: usize, slot_size: usize) -> PacketFifo {
        assert!(slots > 0);
        let free = (0..slots).map(|_| PacketSlot::new(slot_size)).collect();
        PacketFifo {
            shared: Arc::new(FifoShared {
                free: Mutex::new(free),
                free_cond: Condvar::new(),
                queue: Mutex::new(VecDeque::with_capacity(slots)),
                not_empty: Condvar::new(),
                slots,
            }),
        }
    }

    pub fn new_video() -> PacketFifo {
        PacketFifo::new(VIDEO_FIFO_SLOTS, VIDEO_FIFO_SLOT_SIZE)
    }

    pub fn new_audio() -> PacketFifo {
        PacketFifo::new(AUDIO_FIFO_SLOTS, AUDIO_FIFO_SLOT_SIZE)
    }

    pub fn new_spu() -> PacketFifo {
        PacketFifo::new(SPU_FIFO_SLOTS, SPU_FIFO_SLOT_SIZE)
    }

    /// Take a free slot, blocking while none is available. The caller owns
    /// the packet until it is `put` or dropped.
    pub fn acquire(&self) -> Packet {
        let mut free = self.shared.free.lock().unwrap();
        loop {
            if let Some(slot) = free.pop() {
                return Packet {
                    slot: Some(slot),
                    home: Arc::downgrade(&self.shared),
                };
            }
            free = self.shared.free_cond.wait(free).unwrap();
        }
    }

    pub fn try_acquire(&self) -> Option<Packet> {
        self.shared.free.lock().unwrap().pop().map(|slot| Packet {
            slot: Some(slot),
            home: Arc::downgrade(&self.shared),
        })
    }

    /// Hand a packet to the consumer side, preserving enqueue order.
    pub fn put(&self, packet: Packet) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(packet);
        self.shared.not_empty.notify_one();
    }

    /// Dequeue the oldest packet, blocking while the queue is empty.
    pub fn get(&self) -> Packet {
        let mut queue = self.shared.queue.lock().unwrap();
        loop {
            if let Some(packet) = queue.pop_front() {
                return packet;
            }
            queue = self.shared.not_empty.wait(queue).unwrap();
        }
    }

    pub fn try_get(&self) -> Option<Packet> {
        self.shared.queue.lock().unwrap().pop_front()
    }

    /// Discard all queued packets, returning their slots to the free list.
    pub fn clear(&self) {
        let drained: Vec<Packet> = self.shared.queue.lock().unwrap().drain(..).collect();
        drop(drained);
    }

    /// Convenience used by the facade and tests: acquire + tag + put.
    pub fn post_control(&self, control: Control) {
        let mut packet = self.acquire();
        packet.set_control(control);
        self.put(packet);
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_len(&self) -> usize {
        self.shared.free.lock().unwrap().len()
    }

    pub fn slots(&self) -> usize {
        self.shared.slots
    }
}

#[cfg(test)]
mod tests {
    use std::{
        thread::{sleep, spawn},
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_slot_conservation() {
        let fifo = PacketFifo::new(4, 64);
        assert_eq!(fifo.free_len(), 4);

        let packets: Vec<Packet> = (0..4).map(|_| fifo.acquire()).collect();
        assert_eq!(fifo.free_len(), 0);
        assert!(fifo.try_acquire().is_none());

        drop(packets);
        assert_eq!(fifo.free_len(), 4);
    }

    #[test]
    fn test_fifo_order() {
        let fifo = PacketFifo::new(8, 64);
        for pts in [100, 200, 300] {
            let mut packet = fifo.acquire();
            packet.set_data(StreamTag::VIDEO_MPEG);
            packet.pts = pts;
            fifo.put(packet);
        }
        assert_eq!(fifo.len(), 3);
        for pts in [100, 200, 300] {
            assert_eq!(fifo.get().pts, pts);
        }
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_get_blocks_until_put() {
        let fifo = PacketFifo::new(2, 64);
        let producer = fifo.clone();
        let handle = spawn(move || {
            sleep(Duration::from_millis(20));
            producer.post_control(Control::Quit);
        });
        let packet = fifo.get();
        assert_eq!(packet.body, PacketBody::Control(Control::Quit));
        handle.join().unwrap();
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let fifo = PacketFifo::new(1, 64);
        let held = fifo.acquire();
        let releaser = fifo.clone();
        let handle = spawn(move || {
            sleep(Duration::from_millis(20));
            drop(held);
        });
        // Blocks until the spawned thread drops its packet.
        let packet = fifo.acquire();
        drop(packet);
        handle.join().unwrap();
        assert_eq!(fifo.free_len(), 1);
    }

    #[test]
    fn test_clear_returns_slots() {
        let fifo = PacketFifo::new(3, 64);
        for _ in 0..3 {
            fifo.post_control(Control::Nop);
        }
        assert_eq!(fifo.free_len(), 0);
        fifo.clear();
        assert!(fifo.is_empty());
        assert_eq!(fifo.free_len(), 3);
    }

    #[test]
    fn test_payload_reset_on_release() {
        let fifo = PacketFifo::new(1, 64);
        let mut packet = fifo.acquire();
        packet.set_data(StreamTag::AUDIO_AC3);
        packet.payload.extend_from_slice(&[1, 2, 3]);
        packet.pts = 42;
        drop(packet);

        let packet = fifo.acquire();
        assert!(packet.payload.is_empty());
        assert_eq!(packet.pts, 0);
        assert_eq!(packet.body, PacketBody::Control(Control::Nop));
    }

    #[test]
    fn test_stream_tag_fields() {
        let tag = StreamTag::AUDIO_AC3.with_index(3);
        assert_eq!(tag.class(), Some(StreamClass::Audio));
        assert_eq!(tag.family(), 1);
        assert_eq!(tag.index(), 3);
        assert_eq!(StreamTag::VIDEO_H264.class(), Some(StreamClass::Video));
        assert_eq!(StreamTag::SPU_DVB.class(), Some(StreamClass::Spu));
        assert_eq!(StreamTag(0x0100_0000).class(), None);
    }

    #[test]
    fn test_decoder_flags() {
        let mut flags = DecoderFlags::HEADER | DecoderFlags::FRAME_END;
        assert!(flags.contains(DecoderFlags::HEADER));
        assert!(!flags.contains(DecoderFlags::SEEK));
        flags.insert(DecoderFlags::SEEK);
        assert!(flags.contains(DecoderFlags::SEEK));
    }
}
