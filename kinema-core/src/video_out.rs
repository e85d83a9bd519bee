//! Decoded-frame pool and the timed display loop.
//!
//! Frames cycle between a `free` and a `display` queue. Three lock bits
//! (decoder, display, driver) track which role still needs the frame; the
//! bit cleared last sends the frame back to `free`. The display loop wakes
//! once per frame duration and decides per tick whether to drop expired
//! frames, wait for the head frame's VPTS, or hand it to the driver.

pub mod scale;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering::Relaxed},
        Arc, Condvar, Mutex, MutexGuard, RwLock, Weak,
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::Result;
use tracing::{info, trace, warn};

use crate::{
    events::{Event, EventBus},
    metronom::Metronom,
    overlay::{Overlay, OverlaySource},
};

pub const NUM_FRAME_BUFFERS: usize = 15;

/// Frames delivered between two statistics log lines.
const STATS_WINDOW: u64 = 200;

const LOCK_DECODER: u8 = 0b001;
const LOCK_DISPLAY: u8 = 0b010;
const LOCK_DRIVER: u8 = 0b100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum FrameFormat {
    Yv12,
    Yuy2,
    Rgb,
}

impl FrameFormat {
    pub fn fourcc(self) -> u32 {
        match self {
            FrameFormat::Yv12 => 0x3231_5659,
            FrameFormat::Yuy2 => 0x3259_5559,
            FrameFormat::Rgb => 0x5247_4200,
        }
    }
}

/// Aspect ratio code as delivered by the stream headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum AspectCode {
    Forbidden,
    Square,
    FourThree,
    Anamorphic,
    PanScan,
    Dvb211,
    DontTouch,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct FrameFlags(pub u32);

impl FrameFlags {
    pub const PROGRESSIVE: FrameFlags = FrameFlags(0x1);
    pub const REPEAT_FIRST_FIELD: FrameFlags = FrameFlags(0x2);

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

/// Pixel storage and per-picture metadata. Guarded by the frame's mutex.
#[derive(Debug)]
pub struct FrameData {
    pub planes: [Vec<u8>; 3],
    pub pitches: [usize; 3],
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub ratio_code: AspectCode,
    /// Source PTS as delivered by the demuxer, never overwritten.
    pub pts: i64,
    /// Presentation time on the engine's virtual timeline.
    pub vpts: i64,
    pub duration: i64,
    pub bad_frame: bool,
    pub progressive: bool,
    pub repeat_first_field: bool,
}

impl FrameData {
    pub fn empty() -> FrameData {
        FrameData {
            planes: [Vec::new(), Vec::new(), Vec::new()],
            pitches: [0; 3],
            width: 0,
            height: 0,
            format: FrameFormat::Yv12,
            ratio_code: AspectCode::FourThree,
            pts: 0,
            vpts: 0,
            duration: 0,
            bad_frame: false,
            progressive: true,
            repeat_first_field: false,
        }
    }
}

/// Software plane allocation, shared by drivers that keep frames in main
/// memory.
pub fn alloc_planes(frame: &mut FrameData, width: u32, height: u32, format: FrameFormat) {
    let w = width as usize;
    let h = height as usize;
    let (pitches, sizes) = match format {
        FrameFormat::Yv12 => ([w, w / 2, w / 2], [w * h, w * h / 4, w * h / 4]),
        FrameFormat::Yuy2 => ([w * 2, 0, 0], [w * h * 2, 0, 0]),
        FrameFormat::Rgb => ([w * 3, 0, 0], [w * h * 3, 0, 0]),
    };
    frame.width = width;
    frame.height = height;
    frame.format = format;
    frame.pitches = pitches;
    for (plane, size) in frame.planes.iter_mut().zip(sizes) {
        plane.clear();
        plane.resize(size, 0);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverProperty {
    Brightness,
    Contrast,
    Saturation,
    Hue,
    AspectRatio,
    Fullscreen,
    Interlaced,
    Colorkey,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct DriverCaps(pub u32);

impl DriverCaps {
    pub const YV12: DriverCaps = DriverCaps(0x1);
    pub const YUY2: DriverCaps = DriverCaps(0x2);
    pub const RGB: DriverCaps = DriverCaps(0x4);
    pub const BRIGHTNESS: DriverCaps = DriverCaps(0x10);
    pub const CONTRAST: DriverCaps = DriverCaps(0x20);
    pub const SATURATION: DriverCaps = DriverCaps(0x40);
    pub const HUE: DriverCaps = DriverCaps(0x80);

    pub fn contains(self, other: DriverCaps) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for DriverCaps {
    type Output = DriverCaps;

    fn bitor(self, rhs: DriverCaps) -> DriverCaps {
        DriverCaps(self.0 | rhs.0)
    }
}

#[derive(Debug)]
pub enum DriverEvent {
    Expose,
    GuiResize { width: u32, height: u32 },
}

/// The platform video driver the output stage feeds.
///
/// `display_frame` receives a handle holding the driver lock bit; the driver
/// calls [`Frame::displayed`] once the hardware has shown the picture.
pub trait VideoDriver: Send + Sync {
    fn capabilities(&self) -> DriverCaps;

    /// Make sure the frame's plane storage matches the requested geometry,
    /// reallocating if the format changed.
    fn update_frame_format(
        &self,
        frame: &mut FrameData,
        width: u32,
        height: u32,
        ratio: AspectCode,
        format: FrameFormat,
    ) -> Result<()>;

    fn display_frame(&self, frame: Frame) -> Result<()>;

    /// Drivers with hardware overlay support override this; the default is
    /// the in-place CPU blend.
    fn overlay_blend(&self, frame: &mut FrameData, overlay: &Overlay) {
        crate::overlay::blend(frame, overlay);
    }

    fn get_property(&self, _property: DriverProperty) -> i32 {
        0
    }

    fn set_property(&self, _property: DriverProperty, value: i32) -> i32 {
        value
    }

    fn handle_event(&self, _event: &DriverEvent) {}

    fn close(&self) {}
}

/// A pooled video frame. Clones share the picture; the pool slot returns to
/// `free` when the last lock bit is cleared.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

struct FrameInner {
    id: usize,
    locks: AtomicU8,
    data: Mutex<FrameData>,
    home: Weak<VideoOutShared>,
}

impl Frame {
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn data(&self) -> MutexGuard<'_, FrameData> {
        self.inner.data.lock().unwrap()
    }

    pub fn vpts(&self) -> i64 {
        self.data().vpts
    }

    /// Release the decoder's claim on this frame.
    pub fn free(&self) {
        self.clear_lock(LOCK_DECODER);
    }

    /// Called by the driver once the picture has been shown.
    pub fn displayed(&self) {
        self.clear_lock(LOCK_DRIVER);
    }

    #[cfg(test)]
    pub(crate) fn lock_bits(&self) -> u8 {
        self.inner.locks.load(Relaxed)
    }

    fn set_lock(&self, bit: u8) {
        self.inner.locks.fetch_or(bit, Relaxed);
    }

    fn clear_lock(&self, bit: u8) {
        let prev = self.inner.locks.fetch_and(!bit, Relaxed);
        if prev & !bit == 0 && prev != 0 {
            if let Some(home) = self.inner.home.upgrade() {
                home.free.push(self.clone());
            }
        }
    }
}

struct FrameQueue {
    queue: Mutex<VecDeque<Frame>>,
    not_empty: Condvar,
}

impl FrameQueue {
    fn new() -> FrameQueue {
        FrameQueue {
            queue: Mutex::new(VecDeque::with_capacity(NUM_FRAME_BUFFERS)),
            not_empty: Condvar::new(),
        }
    }

    fn push(&self, frame: Frame) {
        self.queue.lock().unwrap().push_back(frame);
        self.not_empty.notify_one();
    }

    fn push_front(&self, frame: Frame) {
        self.queue.lock().unwrap().push_front(frame);
        self.not_empty.notify_one();
    }

    fn pop_blocking(&self) -> Frame {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(frame) = queue.pop_front() {
                return frame;
            }
            queue = self.not_empty.wait(queue).unwrap();
        }
    }

    fn try_pop(&self) -> Option<Frame> {
        self.queue.lock().unwrap().pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[derive(Clone, Copy, Default, Debug, serde::Serialize)]
pub struct FrameStats {
    pub delivered: u64,
    pub skipped: u64,
    pub discarded: u64,
}

#[derive(Default)]
struct StatsInner {
    window: FrameStats,
    total: FrameStats,
}

struct Timing {
    pts_per_frame: i64,
    pts_per_half_frame: i64,
    width: u32,
    height: u32,
    ratio: AspectCode,
}

struct VideoOutShared {
    metronom: Arc<Metronom>,
    driver: Box<dyn VideoDriver>,
    free: FrameQueue,
    display: FrameQueue,
    running: AtomicBool,
    timing: Mutex<Timing>,
    stats: Mutex<StatsInner>,
    overlay_source: RwLock<Option<Arc<dyn OverlaySource>>>,
    events: RwLock<Option<EventBus>>,
    last_frame: Mutex<Option<Frame>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// The video output stage. Cheap to clone; decoders use their clone as the
/// sink they draw into.
#[derive(Clone)]
pub struct VideoOutput {
    shared: Arc<VideoOutShared>,
}

impl VideoOutput {
    pub fn new(driver: Box<dyn VideoDriver>, metronom: Arc<Metronom>) -> VideoOutput {
        let shared = Arc::new(VideoOutShared {
            metronom,
            driver,
            free: FrameQueue::new(),
            display: FrameQueue::new(),
            running: AtomicBool::new(false),
            timing: Mutex::new(Timing {
                pts_per_frame: 0,
                pts_per_half_frame: 0,
                width: 0,
                height: 0,
                ratio: AspectCode::FourThree,
            }),
            stats: Mutex::new(StatsInner::default()),
            overlay_source: RwLock::new(None),
            events: RwLock::new(None),
            last_frame: Mutex::new(None),
            thread: Mutex::new(None),
        });

        for id in 0..NUM_FRAME_BUFFERS {
            shared.free.push(Frame {
                inner: Arc::new(FrameInner {
                    id,
                    locks: AtomicU8::new(0),
                    data: Mutex::new(FrameData::empty()),
                    home: Arc::downgrade(&shared),
                }),
            });
        }

        VideoOutput { shared }
    }

    /// Start the display loop.
    pub fn open(&self) {
        if self.shared.running.swap(true, Relaxed) {
            warn!("display loop already running");
            return;
        }
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("video-out".into())
            .spawn(move || display_loop(shared))
            .expect("failed to spawn video output thread");
        *self.shared.thread.lock().unwrap() = Some(handle);
        info!("display loop started");
    }

    /// Stop the display loop and recycle everything still queued.
    pub fn close(&self) {
        self.shared.running.store(false, Relaxed);
        if let Some(handle) = self.shared.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.drain_display();
        self.shared.last_frame.lock().unwrap().take();
        self.shared.driver.close();
    }

    /// Recycle frames a decoder drew after the loop already drained. Safe
    /// to call at any point during teardown.
    pub(crate) fn drain_display(&self) {
        while let Some(frame) = self.shared.display.try_pop() {
            frame.clear_lock(LOCK_DISPLAY);
        }
    }

    /// Pull a frame from the free pool, blocking while the pool is drained.
    /// The returned frame carries the decoder lock.
    pub fn get_frame(
        &self,
        width: u32,
        height: u32,
        ratio: AspectCode,
        format: FrameFormat,
        duration: i64,
        flags: FrameFlags,
    ) -> Result<Frame> {
        let format_changed = {
            let mut timing = self.shared.timing.lock().unwrap();
            if timing.pts_per_frame != duration {
                timing.pts_per_frame = duration;
                timing.pts_per_half_frame = duration / 2;
                self.shared.metronom.set_video_rate(duration);
            }
            let changed = timing.width != width || timing.height != height || timing.ratio != ratio;
            timing.width = width;
            timing.height = height;
            timing.ratio = ratio;
            changed
        };
        if format_changed {
            if let Some(events) = self.shared.events.read().unwrap().as_ref() {
                events.send(Event::FrameFormatChange {
                    width,
                    height,
                    aspect: ratio,
                });
            }
        }

        let frame = self.shared.free.pop_blocking();
        {
            let mut data = frame.data();
            if let Err(e) = self
                .shared
                .driver
                .update_frame_format(&mut data, width, height, ratio, format)
            {
                drop(data);
                self.shared.free.push(frame);
                return Err(e);
            }
            data.width = width;
            data.height = height;
            data.ratio_code = ratio;
            data.format = format;
            data.duration = duration;
            data.pts = 0;
            data.vpts = 0;
            data.bad_frame = false;
            data.progressive = flags.contains(FrameFlags::PROGRESSIVE);
            data.repeat_first_field = flags.contains(FrameFlags::REPEAT_FIRST_FIELD);
        }
        frame.inner.locks.store(LOCK_DECODER, Relaxed);
        Ok(frame)
    }

    /// Stamp the frame with its VPTS and append it to the display queue.
    ///
    /// The decoder's claim is always consumed. If the frame is already late
    /// by more than half a frame it goes straight back to the pool and the
    /// returned count tells the decoder how many upcoming frames to skip.
    pub fn draw(&self, frame: &Frame) -> i64 {
        let (pts, duration) = {
            let data = frame.data();
            (data.pts, data.duration)
        };
        let vpts = self.shared.metronom.got_video_frame(pts, duration);
        let (pts_per_frame, pts_per_half_frame) = {
            let timing = self.shared.timing.lock().unwrap();
            (timing.pts_per_frame.max(1), timing.pts_per_half_frame)
        };

        let cur_vpts = self.shared.metronom.get_current_time();
        let diff = vpts - cur_vpts;
        let mut frames_to_skip = 0;

        let bad_frame = {
            let mut data = frame.data();
            data.vpts = vpts;
            data.bad_frame
        };

        if cur_vpts > 0 && diff < -pts_per_half_frame {
            // Decoder is behind the clock; dump this frame and tell it how
            // much to drop to catch up.
            frames_to_skip = ((-diff) / pts_per_frame + 3) * 2;
            trace!(vpts, cur_vpts, frames_to_skip, "late frame rejected");
            frame.data().bad_frame = true;
            self.count_discarded();
            frame.clear_lock(LOCK_DECODER);
        } else if bad_frame {
            self.count_skipped();
            frame.clear_lock(LOCK_DECODER);
        } else {
            *self.shared.last_frame.lock().unwrap() = Some(frame.clone());
            frame.set_lock(LOCK_DISPLAY);
            frame.clear_lock(LOCK_DECODER);
            self.shared.display.push(frame.clone());
        }

        self.count_delivered();
        frames_to_skip
    }

    pub fn register_overlay_source(&self, source: Arc<dyn OverlaySource>) {
        *self.shared.overlay_source.write().unwrap() = Some(source);
    }

    pub fn set_event_bus(&self, events: EventBus) {
        *self.shared.events.write().unwrap() = Some(events);
    }

    pub fn unregister_overlay_source(&self) {
        self.shared.overlay_source.write().unwrap().take();
    }

    /// Most recently drawn frame, for screenshot-style consumers.
    pub fn last_frame(&self) -> Option<Frame> {
        self.shared.last_frame.lock().unwrap().clone()
    }

    pub fn capabilities(&self) -> DriverCaps {
        self.shared.driver.capabilities()
    }

    pub fn get_property(&self, property: DriverProperty) -> i32 {
        self.shared.driver.get_property(property)
    }

    pub fn set_property(&self, property: DriverProperty, value: i32) -> i32 {
        self.shared.driver.set_property(property, value)
    }

    pub fn handle_event(&self, event: &DriverEvent) {
        self.shared.driver.handle_event(event);
    }

    pub fn stats(&self) -> FrameStats {
        self.shared.stats.lock().unwrap().total
    }

    pub fn free_len(&self) -> usize {
        self.shared.free.len()
    }

    pub fn display_len(&self) -> usize {
        self.shared.display.len()
    }

    fn count_delivered(&self) {
        let mut stats = self.shared.stats.lock().unwrap();
        stats.window.delivered += 1;
        stats.total.delivered += 1;
        if stats.window.delivered >= STATS_WINDOW {
            info!(
                delivered = stats.window.delivered,
                skipped = stats.window.skipped,
                discarded = stats.window.discarded,
                "frame statistics"
            );
            stats.window = FrameStats::default();
        }
    }

    fn count_skipped(&self) {
        let mut stats = self.shared.stats.lock().unwrap();
        stats.window.skipped += 1;
        stats.total.skipped += 1;
    }

    fn count_discarded(&self) {
        let mut stats = self.shared.stats.lock().unwrap();
        stats.window.discarded += 1;
        stats.total.discarded += 1;
    }
}

fn display_loop(shared: Arc<VideoOutShared>) {
    while shared.running.load(Relaxed) {
        // Ten ticks per frame duration: a frame becoming due between ticks
        // must still be picked up well inside the half-frame drop window.
        let step = shared.metronom.get_video_rate().max(900);
        std::thread::sleep(Duration::from_micros((step as u64 * 10 / 9).max(1000)));

        let cur_vpts = shared.metronom.get_current_time();
        let pts_per_half_frame = shared.timing.lock().unwrap().pts_per_half_frame;

        // Drop expired frames, then either wait for the head frame's time
        // or take it out for display. This loop is the queue's only
        // consumer, so pop + push_front is race-free.
        let mut frame = None;
        while let Some(candidate) = shared.display.try_pop() {
            let vpts = candidate.vpts();
            if cur_vpts - vpts > pts_per_half_frame {
                trace!(vpts, cur_vpts, "discarding expired frame");
                {
                    let mut stats = shared.stats.lock().unwrap();
                    stats.window.discarded += 1;
                    stats.total.discarded += 1;
                }
                candidate.clear_lock(LOCK_DISPLAY);
                continue;
            }
            if vpts > cur_vpts {
                shared.display.push_front(candidate);
            } else {
                frame = Some(candidate);
            }
            break;
        }
        let Some(frame) = frame else {
            continue;
        };

        // Blend any overlay covering this frame's presentation time before
        // the driver takes over the pixels.
        let source = shared.overlay_source.read().unwrap().clone();
        if let Some(source) = source {
            let vpts = frame.vpts();
            if let Some(overlay) = source.get_overlay(vpts) {
                let mut data = frame.data();
                shared.driver.overlay_blend(&mut data, &overlay);
            }
        }

        frame.set_lock(LOCK_DRIVER);
        frame.clear_lock(LOCK_DISPLAY);
        if let Err(e) = shared.driver.display_frame(frame.clone()) {
            warn!(%e, "driver failed to display frame");
            frame.clear_lock(LOCK_DRIVER);
        }
    }

    // Cancelled: recycle whatever is still queued.
    while let Some(frame) = shared.display.try_pop() {
        frame.clear_lock(LOCK_DISPLAY);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        thread::sleep,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::metronom::{Speed, PREBUFFER_PTS_OFFSET};

    /// Driver keeping frames in main memory and releasing them immediately.
    struct TestDriver {
        displayed: Mutex<Vec<i64>>,
        fail_alloc: AtomicBool,
        fail_display: AtomicBool,
        hold_frames: AtomicBool,
        held: Mutex<Vec<Frame>>,
        format_updates: AtomicUsize,
    }

    impl TestDriver {
        fn new() -> Arc<TestDriver> {
            Arc::new(TestDriver {
                displayed: Mutex::new(Vec::new()),
                fail_alloc: AtomicBool::new(false),
                fail_display: AtomicBool::new(false),
                hold_frames: AtomicBool::new(false),
                held: Mutex::new(Vec::new()),
                format_updates: AtomicUsize::new(0),
            })
        }
    }

    impl VideoDriver for Arc<TestDriver> {
        fn capabilities(&self) -> DriverCaps {
            DriverCaps::YV12 | DriverCaps::YUY2
        }

        fn update_frame_format(
            &self,
            frame: &mut FrameData,
            width: u32,
            height: u32,
            _ratio: AspectCode,
            format: FrameFormat,
        ) -> Result<()> {
            if self.fail_alloc.load(Relaxed) {
                anyhow::bail!("plane allocation failed");
            }
            if frame.width != width || frame.height != height || frame.format != format {
                self.format_updates.fetch_add(1, Relaxed);
                alloc_planes(frame, width, height, format);
            }
            Ok(())
        }

        fn display_frame(&self, frame: Frame) -> Result<()> {
            if self.fail_display.load(Relaxed) {
                anyhow::bail!("display failed");
            }
            self.displayed.lock().unwrap().push(frame.vpts());
            if self.hold_frames.load(Relaxed) {
                self.held.lock().unwrap().push(frame);
            } else {
                frame.displayed();
            }
            Ok(())
        }
    }

    fn test_output() -> (VideoOutput, Arc<TestDriver>, Arc<Metronom>) {
        kinema_util::log::init();
        let metronom = Metronom::new(false);
        let driver = TestDriver::new();
        let output = VideoOutput::new(Box::new(driver.clone()), metronom.clone());
        (output, driver, metronom)
    }

    fn draw_frame(output: &VideoOutput, pts: i64) -> i64 {
        let frame = output
            .get_frame(
                16,
                16,
                AspectCode::FourThree,
                FrameFormat::Yv12,
                3600,
                FrameFlags::PROGRESSIVE,
            )
            .unwrap();
        frame.data().pts = pts;
        output.draw(&frame)
    }

    #[test]
    fn test_pool_starts_full() {
        let (output, _, metronom) = test_output();
        assert_eq!(output.free_len(), NUM_FRAME_BUFFERS);
        assert_eq!(output.display_len(), 0);
        metronom.shutdown();
    }

    #[test]
    fn test_get_frame_locks_and_free_recycles() {
        let (output, _, metronom) = test_output();
        let frame = output
            .get_frame(
                16,
                16,
                AspectCode::FourThree,
                FrameFormat::Yv12,
                3600,
                FrameFlags::default(),
            )
            .unwrap();
        assert_eq!(output.free_len(), NUM_FRAME_BUFFERS - 1);
        assert_eq!(frame.lock_bits(), LOCK_DECODER);
        frame.free();
        assert_eq!(output.free_len(), NUM_FRAME_BUFFERS);
        metronom.shutdown();
    }

    #[test]
    fn test_draw_appends_in_order() {
        let (output, _, metronom) = test_output();
        // Clock not started: current time is 0, nothing can be late.
        for i in 0..3 {
            let skip = draw_frame(&output, i * 3600);
            assert_eq!(skip, 0);
        }
        assert_eq!(output.display_len(), 3);
        assert_eq!(output.free_len(), NUM_FRAME_BUFFERS - 3);
        assert_eq!(output.stats().delivered, 3);
        assert_eq!(output.stats().discarded, 0);
        metronom.shutdown();
    }

    #[test]
    fn test_draw_late_frame_rejected() {
        let (output, _, metronom) = test_output();
        metronom.start_clock(0);
        // Jump the clock far past the frame's vpts.
        metronom.adjust_clock(500_000);
        let skip = draw_frame(&output, 3600);
        assert!(skip > 0);
        assert_eq!(output.display_len(), 0);
        assert_eq!(output.free_len(), NUM_FRAME_BUFFERS);
        assert_eq!(output.stats().discarded, 1);
        metronom.shutdown();
    }

    #[test]
    fn test_bad_frame_skipped_not_queued() {
        let (output, _, metronom) = test_output();
        let frame = output
            .get_frame(
                16,
                16,
                AspectCode::FourThree,
                FrameFormat::Yv12,
                3600,
                FrameFlags::default(),
            )
            .unwrap();
        frame.data().bad_frame = true;
        output.draw(&frame);
        assert_eq!(output.display_len(), 0);
        assert_eq!(output.stats().skipped, 1);
        assert_eq!(output.free_len(), NUM_FRAME_BUFFERS);
        metronom.shutdown();
    }

    #[test]
    fn test_alloc_failure_returns_frame_to_pool() {
        let (output, driver, metronom) = test_output();
        driver.fail_alloc.store(true, Relaxed);
        let result = output.get_frame(
            16,
            16,
            AspectCode::FourThree,
            FrameFormat::Yv12,
            3600,
            FrameFlags::default(),
        );
        assert!(result.is_err());
        assert_eq!(output.free_len(), NUM_FRAME_BUFFERS);
        metronom.shutdown();
    }

    #[test]
    fn test_display_loop_shows_due_frames_in_order() {
        let (output, driver, metronom) = test_output();
        metronom.start_clock(PREBUFFER_PTS_OFFSET);
        metronom.set_speed(Speed::NORMAL);
        output.open();

        for i in 0..5 {
            draw_frame(&output, i * 3600);
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while driver.displayed.lock().unwrap().len() < 5 && Instant::now() < deadline {
            sleep(Duration::from_millis(10));
        }
        output.close();

        let displayed = driver.displayed.lock().unwrap().clone();
        assert_eq!(displayed.len(), 5, "displayed = {displayed:?}");
        assert!(displayed.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(output.free_len(), NUM_FRAME_BUFFERS);
        metronom.shutdown();
    }

    #[test]
    fn test_display_loop_drops_expired_frames() {
        let (output, driver, metronom) = test_output();
        // Queue frames first, then start a clock far in the future: all of
        // them are expired by the time the loop looks.
        for i in 0..4 {
            draw_frame(&output, i * 3600);
        }
        assert_eq!(output.display_len(), 4);
        metronom.start_clock(1_000_000);
        output.open();

        let deadline = Instant::now() + Duration::from_secs(2);
        while output.display_len() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(10));
        }
        output.close();

        assert!(driver.displayed.lock().unwrap().is_empty());
        assert_eq!(output.stats().discarded, 4);
        assert_eq!(output.free_len(), NUM_FRAME_BUFFERS);
        metronom.shutdown();
    }

    #[test]
    fn test_driver_hold_keeps_frame_out_of_pool() {
        let (output, driver, metronom) = test_output();
        driver.hold_frames.store(true, Relaxed);
        metronom.start_clock(PREBUFFER_PTS_OFFSET);
        output.open();

        draw_frame(&output, 0);
        let deadline = Instant::now() + Duration::from_secs(2);
        while driver.displayed.lock().unwrap().is_empty() && Instant::now() < deadline {
            sleep(Duration::from_millis(10));
        }
        output.close();

        // The driver still holds the frame.
        assert_eq!(output.free_len(), NUM_FRAME_BUFFERS - 1);
        let held = driver.held.lock().unwrap().pop().unwrap();
        held.displayed();
        assert_eq!(output.free_len(), NUM_FRAME_BUFFERS);
        metronom.shutdown();
    }

    #[test]
    fn test_close_drains_display_queue() {
        let (output, _, metronom) = test_output();
        for i in 0..3 {
            draw_frame(&output, i * 3600);
        }
        output.open();
        output.close();
        assert_eq!(output.display_len(), 0);
        assert_eq!(output.free_len(), NUM_FRAME_BUFFERS);
        metronom.shutdown();
    }
}
