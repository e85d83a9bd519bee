//! Master clock and PTS -> VPTS mapping.
//!
//! Source PTS values wrap, arrive out of order around B-frame reordering and
//! reset across splices. The metronom maps them onto a single monotonic
//! virtual timeline:
//!
//! ```text
//! video_pts + video_wrap_offset = video_vpts
//! audio_pts + audio_wrap_offset = audio_vpts
//! ```
//!
//! The wrap offsets are equal except for brief windows around an announced
//! discontinuity, and VPTS values are interpolated whenever a frame or sample
//! block carries no PTS of its own.

use std::{
    sync::{Arc, Condvar, Mutex, Weak},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info, trace, warn};

pub const PTS_PER_SECOND: i64 = 90_000;
pub const PREBUFFER_PTS_OFFSET: i64 = 30_000;
pub const VIDEO_DRIFT_TOLERANCE: i64 = 45_000;
pub const WRAP_THRESHOLD: i64 = 120_000;
pub const MAX_NUM_WRAP_DIFF: u32 = 10;
pub const AUDIO_SAMPLE_NUM: i64 = 32_768;
pub const MAX_AUDIO_DELTA: i64 = 1_600;

/// Fallback display tick while no frame duration is known yet (25 fps).
const DEFAULT_VIDEO_STEP: i64 = 3_600;

/// How often the sync helper drags the secondary clock providers along.
const SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Playback speed as a fixed-point factor over a denominator of 4.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub struct Speed(pub u32);

impl Speed {
    pub const PAUSE: Speed = Speed(0);
    pub const SLOW_4: Speed = Speed(1);
    pub const SLOW_2: Speed = Speed(2);
    pub const NORMAL: Speed = Speed(4);
    pub const FAST_2: Speed = Speed(8);
    pub const FAST_4: Speed = Speed(16);

    pub fn factor(self) -> f64 {
        self.0 as f64 / 4.0
    }

    pub fn clamped(self) -> Speed {
        Speed(self.0.min(Speed::FAST_4.0))
    }
}

/// The kinds of timeline resets a demuxer can announce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscontinuityKind {
    StreamStart,
    Absolute,
    Relative,
    StreamSeek,
}

/// A system clock reference. Multiple providers may be registered; the one
/// with the highest priority is elected master and drives all reads.
pub trait ScrProvider: Send + Sync {
    fn priority(&self) -> i32;

    /// Returns the speed actually applied (a provider may refuse rates it
    /// cannot represent).
    fn set_speed(&self, speed: Speed) -> Speed;

    /// Drag this provider towards the master's current time.
    fn adjust(&self, vpts: i64);

    fn start(&self, vpts: i64);

    fn now(&self) -> i64;
}

struct ScrState {
    pivot: Instant,
    pivot_pts: f64,
    pts_per_sec: f64,
}

impl ScrState {
    fn new() -> ScrState {
        ScrState {
            pivot: Instant::now(),
            pivot_pts: 0.0,
            pts_per_sec: 0.0,
        }
    }

    fn current(&self) -> i64 {
        let elapsed = self.pivot.elapsed().as_secs_f64();
        (self.pivot_pts + elapsed * self.pts_per_sec) as i64
    }

    /// Re-anchor at the current instant so a rate change does not warp the
    /// already elapsed time.
    fn set_pivot(&mut self) {
        let now = Instant::now();
        let elapsed = (now - self.pivot).as_secs_f64();
        self.pivot_pts += elapsed * self.pts_per_sec;
        self.pivot = now;
    }
}

/// Default wall-clock provider, always registered. Low priority so that any
/// stream-embedded clock outranks it.
pub struct SystemScr {
    state: Mutex<ScrState>,
}

impl SystemScr {
    pub fn new() -> SystemScr {
        let scr = SystemScr {
            state: Mutex::new(ScrState::new()),
        };
        scr.set_speed(Speed::PAUSE);
        scr
    }
}

impl Default for SystemScr {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrProvider for SystemScr {
    fn priority(&self) -> i32 {
        5
    }

    fn set_speed(&self, speed: Speed) -> Speed {
        let mut state = self.state.lock().unwrap();
        state.set_pivot();
        state.pts_per_sec = speed.factor() * PTS_PER_SECOND as f64;
        speed
    }

    fn adjust(&self, vpts: i64) {
        let mut state = self.state.lock().unwrap();
        state.pivot = Instant::now();
        state.pivot_pts = vpts as f64;
    }

    fn start(&self, vpts: i64) {
        {
            let mut state = self.state.lock().unwrap();
            state.pivot = Instant::now();
            state.pivot_pts = vpts as f64;
        }
        self.set_speed(Speed::NORMAL);
    }

    fn now(&self) -> i64 {
        self.state.lock().unwrap().current()
    }
}

/// Clock provider for streaming inputs: very high priority and immune to
/// `adjust` unless explicitly made adjustable, so the receiver-side clock
/// cannot be dragged around by the audio hardware.
pub struct StrictScr {
    state: Mutex<ScrState>,
    adjustable: std::sync::atomic::AtomicBool,
}

impl StrictScr {
    pub fn new() -> StrictScr {
        let scr = StrictScr {
            state: Mutex::new(ScrState::new()),
            adjustable: std::sync::atomic::AtomicBool::new(false),
        };
        scr.set_speed(Speed::NORMAL);
        scr
    }

    pub fn set_adjustable(&self, adjustable: bool) {
        self.adjustable
            .store(adjustable, std::sync::atomic::Ordering::Relaxed);
    }
}

impl Default for StrictScr {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrProvider for StrictScr {
    fn priority(&self) -> i32 {
        100
    }

    fn set_speed(&self, speed: Speed) -> Speed {
        let mut state = self.state.lock().unwrap();
        state.set_pivot();
        state.pts_per_sec = speed.factor() * PTS_PER_SECOND as f64;
        speed
    }

    fn adjust(&self, vpts: i64) {
        if self.adjustable.load(std::sync::atomic::Ordering::Relaxed) {
            let mut state = self.state.lock().unwrap();
            state.pivot = Instant::now();
            state.pivot_pts = vpts as f64;
        }
    }

    fn start(&self, vpts: i64) {
        let mut state = self.state.lock().unwrap();
        state.pivot = Instant::now();
        state.pivot_pts = vpts as f64;
    }

    fn now(&self) -> i64 {
        self.state.lock().unwrap().current()
    }
}

struct ClockState {
    pts_per_smpls: i64,
    audio_pts_delta: i64,

    video_vpts: i64,
    audio_vpts: i64,
    spu_vpts: i64,

    video_wrap_offset: i64,
    audio_wrap_offset: i64,
    wrap_diff_counter: u32,

    last_video_pts: i64,
    last_audio_pts: i64,
    num_audio_samples_guessed: i64,

    av_offset: i64,
    video_step: i64,

    video_discontinuity: bool,
    audio_discontinuity: bool,
    video_discontinuity_count: u32,
    audio_discontinuity_count: u32,

    providers: Vec<Arc<dyn ScrProvider>>,
    master: usize,
}

impl ClockState {
    fn elect_master(&mut self) {
        let mut best = 0;
        for (i, scr) in self.providers.iter().enumerate() {
            if scr.priority() > self.providers[best].priority() {
                best = i;
            }
        }
        self.master = best;
    }

    fn master(&self) -> Arc<dyn ScrProvider> {
        self.providers[self.master].clone()
    }

    /// Audio and video wrap offsets are not allowed to differ for long
    /// outside a discontinuity window; force them to the larger one after
    /// MAX_NUM_WRAP_DIFF PTS-bearing updates.
    fn enforce_wrap_agreement(&mut self, have_audio: bool) {
        if !have_audio
            || self.video_wrap_offset == self.audio_wrap_offset
            || self.video_discontinuity
            || self.audio_discontinuity
        {
            return;
        }
        self.wrap_diff_counter += 1;
        if self.wrap_diff_counter > MAX_NUM_WRAP_DIFF {
            let forced = self.video_wrap_offset.max(self.audio_wrap_offset);
            warn!(
                video_wrap = self.video_wrap_offset,
                audio_wrap = self.audio_wrap_offset,
                forced, "forcing wrap offsets to agree"
            );
            self.video_wrap_offset = forced;
            self.audio_wrap_offset = forced;
            self.wrap_diff_counter = 0;
        }
    }
}

/// The engine's master clock. One instance per engine, shared by every
/// worker through an `Arc`.
pub struct Metronom {
    state: Mutex<ClockState>,
    video_discontinuity_reached: Condvar,
    audio_discontinuity_reached: Condvar,
    have_audio: bool,
    barrier_interrupted: std::sync::atomic::AtomicBool,
    sync_cancel: Sender<()>,
    sync_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Metronom {
    pub fn new(have_audio: bool) -> Arc<Metronom> {
        let (sync_cancel, cancel_rx) = bounded::<()>(1);
        let metronom = Arc::new(Metronom {
            state: Mutex::new(ClockState {
                pts_per_smpls: 0,
                audio_pts_delta: 0,
                video_vpts: PREBUFFER_PTS_OFFSET,
                audio_vpts: PREBUFFER_PTS_OFFSET,
                spu_vpts: 0,
                video_wrap_offset: PREBUFFER_PTS_OFFSET,
                audio_wrap_offset: PREBUFFER_PTS_OFFSET,
                wrap_diff_counter: 0,
                last_video_pts: 0,
                last_audio_pts: 0,
                num_audio_samples_guessed: 1,
                av_offset: 0,
                video_step: DEFAULT_VIDEO_STEP,
                video_discontinuity: false,
                audio_discontinuity: false,
                video_discontinuity_count: 0,
                audio_discontinuity_count: 0,
                providers: vec![Arc::new(SystemScr::new())],
                master: 0,
            }),
            video_discontinuity_reached: Condvar::new(),
            audio_discontinuity_reached: Condvar::new(),
            have_audio,
            barrier_interrupted: std::sync::atomic::AtomicBool::new(false),
            sync_cancel,
            sync_thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&metronom);
        let handle = std::thread::Builder::new()
            .name("metronom-sync".into())
            .spawn(move || sync_loop(weak, cancel_rx))
            .expect("failed to spawn metronom sync thread");
        *metronom.sync_thread.lock().unwrap() = Some(handle);

        metronom
    }

    /// Permanently disarm the discontinuity barrier so a worker whose peer
    /// has already quit cannot wait forever. Called once at the start of
    /// pipeline teardown.
    pub fn interrupt_barrier(&self) {
        self.barrier_interrupted
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let _state = self.state.lock().unwrap();
        self.video_discontinuity_reached.notify_all();
        self.audio_discontinuity_reached.notify_all();
    }

    /// Stop the sync helper. Called by the facade as the last step of
    /// pipeline teardown.
    pub fn shutdown(&self) {
        let _ = self.sync_cancel.try_send(());
        if let Some(handle) = self.sync_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    // ---- clock sources --------------------------------------------------

    pub fn register_scr(&self, scr: Arc<dyn ScrProvider>) {
        let mut state = self.state.lock().unwrap();
        state.providers.push(scr);
        state.elect_master();
    }

    pub fn unregister_scr(&self, scr: &Arc<dyn ScrProvider>) {
        let mut state = self.state.lock().unwrap();
        // The wall-clock provider at index 0 can never be removed.
        if let Some(i) = state
            .providers
            .iter()
            .skip(1)
            .position(|p| Arc::ptr_eq(p, scr))
        {
            state.providers.remove(i + 1);
            state.elect_master();
        }
    }

    pub fn start_clock(&self, pts: i64) {
        info!(pts, "starting clock");
        let providers = self.state.lock().unwrap().providers.clone();
        for scr in &providers {
            scr.start(pts);
        }
    }

    pub fn stop_clock(&self) {
        let providers = self.state.lock().unwrap().providers.clone();
        for scr in &providers {
            scr.set_speed(Speed::PAUSE);
        }
    }

    pub fn resume_clock(&self) {
        let providers = self.state.lock().unwrap().providers.clone();
        for scr in &providers {
            scr.set_speed(Speed::NORMAL);
        }
    }

    pub fn set_speed(&self, speed: Speed) -> Speed {
        let (master, providers) = {
            let state = self.state.lock().unwrap();
            (state.master(), state.providers.clone())
        };
        let true_speed = master.set_speed(speed);
        for scr in &providers {
            scr.set_speed(true_speed);
        }
        true_speed
    }

    pub fn get_current_time(&self) -> i64 {
        let master = self.state.lock().unwrap().master();
        master.now()
    }

    pub fn adjust_clock(&self, desired_vpts: i64) {
        let master = self.state.lock().unwrap().master();
        master.adjust(desired_vpts);
    }

    // ---- rate bookkeeping ----------------------------------------------

    /// Called by the audio output stage: 90 kHz ticks per
    /// [`AUDIO_SAMPLE_NUM`] samples at the hardware rate.
    pub fn set_audio_rate(&self, pts_per_smpls: i64) {
        self.state.lock().unwrap().pts_per_smpls = pts_per_smpls;
        debug!(pts_per_smpls, "audio rate updated");
    }

    /// Average frame duration, used by the display loop as its tick period.
    pub fn set_video_rate(&self, step: i64) {
        self.state.lock().unwrap().video_step = step.max(1);
    }

    pub fn get_video_rate(&self) -> i64 {
        self.state.lock().unwrap().video_step
    }

    pub fn set_av_offset(&self, offset: i64) {
        self.state.lock().unwrap().av_offset = offset;
        info!(offset, "av offset updated");
    }

    pub fn get_av_offset(&self) -> i64 {
        self.state.lock().unwrap().av_offset
    }

    // ---- pts -> vpts ----------------------------------------------------

    /// Map a video frame onto the virtual timeline and advance the predicted
    /// video clock by the frame's duration. Returns the VPTS to display at.
    pub fn got_video_frame(&self, pts: i64, duration: i64) -> i64 {
        let mut state = self.state.lock().unwrap();
        let mut pts = pts;

        if pts != 0 && !state.video_discontinuity {
            // A jump this large without an announcement is frame reordering
            // around a splice; the pts cannot be trusted for wrap math.
            let predicted = state.last_video_pts + duration;
            if (pts - predicted).abs() > WRAP_THRESHOLD {
                trace!(pts, predicted, "unannounced pts jump ignored");
                pts = 0;
            }
        }

        if pts != 0 {
            if state.video_discontinuity {
                state.video_discontinuity = false;
                state.wrap_diff_counter = 0;
                state.video_wrap_offset = state.video_vpts - pts;
                info!(
                    pts,
                    wrap_offset = state.video_wrap_offset,
                    "video discontinuity resolved"
                );
            } else {
                state.enforce_wrap_agreement(self.have_audio);

                let vpts = pts + state.video_wrap_offset;
                let diff = state.video_vpts - vpts;
                if diff.abs() > VIDEO_DRIFT_TOLERANCE {
                    state.video_vpts = vpts;
                    trace!(diff, vpts, "video vpts jump");
                } else if diff != 0 {
                    // Gentle correction, an eighth of the error per frame.
                    state.video_vpts -= diff / 8;
                }
            }
            state.last_video_pts = pts;
        } else {
            state.last_video_pts = state.video_vpts - state.video_wrap_offset;
        }

        let emitted = state.video_vpts + state.av_offset;
        state.video_vpts += duration;
        emitted
    }

    /// Map an audio block onto the virtual timeline. Advances the predicted
    /// audio clock by the sample count, folding samplerate drift into
    /// `audio_pts_delta`.
    pub fn got_audio_samples(&self, pts: i64, nsamples: i64) -> i64 {
        let mut state = self.state.lock().unwrap();
        let vpts;

        if pts != 0 {
            if state.audio_discontinuity {
                state.audio_discontinuity = false;
                state.wrap_diff_counter = 0;
                state.audio_wrap_offset = state.audio_vpts - pts;
                vpts = pts + state.audio_wrap_offset;
                info!(
                    pts,
                    wrap_offset = state.audio_wrap_offset,
                    "audio discontinuity resolved"
                );
            } else {
                state.enforce_wrap_agreement(self.have_audio);

                vpts = pts + state.audio_wrap_offset;

                // Between two known-pts boundaries, compare the vpts
                // predicted by sample accumulation with the pts-derived one
                // and fold the error into the per-block correction. A jump
                // past MAX_AUDIO_DELTA means a bad pts, not drift.
                if state.last_audio_pts != 0 && pts > state.last_audio_pts {
                    let vpts_diff = vpts - state.audio_vpts;
                    let guessed = state.num_audio_samples_guessed.max(1);
                    state.audio_pts_delta += vpts_diff * AUDIO_SAMPLE_NUM / guessed;
                    if state.audio_pts_delta.abs() >= MAX_AUDIO_DELTA {
                        state.audio_pts_delta = 0;
                    }
                }
            }
            state.num_audio_samples_guessed = 0;
            state.last_audio_pts = pts;
            state.audio_vpts = vpts;
        } else {
            vpts = state.audio_vpts;
        }

        state.audio_vpts +=
            nsamples * (state.audio_pts_delta + state.pts_per_smpls) / AUDIO_SAMPLE_NUM;
        state.num_audio_samples_guessed += nsamples;
        vpts
    }

    /// Subpicture packets are too sparse to maintain wrap state of their
    /// own. Inside a discontinuity window the audio offset is borrowed if
    /// already updated; otherwise 0 signals "drop this overlay".
    pub fn got_spu_packet(&self, pts: i64) -> i64 {
        let mut state = self.state.lock().unwrap();
        let pts = if pts != 0 {
            state.spu_vpts = pts;
            pts
        } else {
            state.spu_vpts
        };

        if state.video_discontinuity {
            if !state.audio_discontinuity {
                pts + state.audio_wrap_offset
            } else {
                0
            }
        } else {
            pts + state.video_wrap_offset
        }
    }

    // ---- discontinuity barrier -----------------------------------------

    /// Announce a video-side timeline reset. Blocks until the audio side has
    /// announced the matching reset, then aligns both predicted clocks to
    /// the later one. The wrap offset itself is recomputed by the next
    /// pts-bearing `got_video_frame`.
    pub fn handle_video_discontinuity(&self, kind: DiscontinuityKind, offset: i64) {
        let mut state = self.state.lock().unwrap();
        if kind == DiscontinuityKind::StreamStart {
            // A fresh stream must not inherit a predicted clock from the
            // past; the prebuffer offset keeps its first frames out of the
            // drop window.
            let target = state.master().now() + PREBUFFER_PTS_OFFSET;
            if state.video_vpts < target {
                state.video_vpts = target;
            }
        }
        state.video_discontinuity = true;
        state.video_discontinuity_count += 1;
        self.video_discontinuity_reached.notify_all();
        info!(
            ?kind,
            offset,
            count = state.video_discontinuity_count,
            "video discontinuity"
        );

        if self.have_audio {
            while !self.barrier_interrupted.load(std::sync::atomic::Ordering::Relaxed)
                && state.audio_discontinuity_count < state.video_discontinuity_count
            {
                debug!(
                    waiting_for = state.video_discontinuity_count,
                    "waiting for audio discontinuity"
                );
                state = self.audio_discontinuity_reached.wait(state).unwrap();
            }
            if state.video_vpts < state.audio_vpts {
                state.video_vpts = state.audio_vpts;
                debug!(vpts = state.video_vpts, "video vpts aligned to audio");
            }
        }
    }

    /// Audio-side counterpart of [`Metronom::handle_video_discontinuity`].
    pub fn handle_audio_discontinuity(&self, kind: DiscontinuityKind, offset: i64) {
        let mut state = self.state.lock().unwrap();
        if kind == DiscontinuityKind::StreamStart {
            let target = state.master().now() + PREBUFFER_PTS_OFFSET;
            if state.audio_vpts < target {
                state.audio_vpts = target;
            }
        }
        state.audio_discontinuity = true;
        state.audio_discontinuity_count += 1;
        self.audio_discontinuity_reached.notify_all();
        info!(
            ?kind,
            offset,
            count = state.audio_discontinuity_count,
            "audio discontinuity"
        );

        while !self.barrier_interrupted.load(std::sync::atomic::Ordering::Relaxed)
            && state.audio_discontinuity_count > state.video_discontinuity_count
        {
            debug!(
                waiting_for = state.audio_discontinuity_count,
                "waiting for video discontinuity"
            );
            state = self.video_discontinuity_reached.wait(state).unwrap();
        }
        if state.audio_vpts < state.video_vpts {
            state.audio_vpts = state.video_vpts;
            debug!(vpts = state.audio_vpts, "audio vpts aligned to video");
        }
    }

    // ---- introspection (used by the facade and tests) -------------------

    pub fn video_vpts(&self) -> i64 {
        self.state.lock().unwrap().video_vpts
    }

    pub fn audio_vpts(&self) -> i64 {
        self.state.lock().unwrap().audio_vpts
    }

    pub fn video_wrap_offset(&self) -> i64 {
        self.state.lock().unwrap().video_wrap_offset
    }

    pub fn audio_wrap_offset(&self) -> i64 {
        self.state.lock().unwrap().audio_wrap_offset
    }

    pub fn have_audio(&self) -> bool {
        self.have_audio
    }
}

/// Periodically drags every non-master provider towards the master so a
/// later master re-election does not warp the timeline.
fn sync_loop(metronom: Weak<Metronom>, cancel: crossbeam::channel::Receiver<()>) {
    loop {
        match cancel.recv_timeout(SYNC_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
        let Some(metronom) = metronom.upgrade() else {
            return;
        };
        let (master_idx, providers) = {
            let state = metronom.state.lock().unwrap();
            (state.master, state.providers.clone())
        };
        let now = providers[master_idx].now();
        for (i, scr) in providers.iter().enumerate() {
            if i != master_idx {
                scr.adjust(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        thread::{sleep, spawn},
        time::Duration,
    };

    use super::*;

    fn new_metronom(have_audio: bool) -> Arc<Metronom> {
        kinema_util::log::init();
        Metronom::new(have_audio)
    }

    #[test]
    fn test_straight_video_sequence() {
        let metronom = new_metronom(false);
        // 100 frames at pts = i * 3600, duration 3600.
        let mut last_vpts = 0;
        for i in 0..100 {
            let vpts = metronom.got_video_frame(i * 3600, 3600);
            assert_eq!(vpts, PREBUFFER_PTS_OFFSET + i * 3600);
            assert!(vpts >= last_vpts);
            last_vpts = vpts;
        }
        assert_eq!(metronom.video_vpts(), PREBUFFER_PTS_OFFSET + 100 * 3600);
        metronom.shutdown();
    }

    #[test]
    fn test_zero_pts_interpolates() {
        let metronom = new_metronom(false);
        let wrap_before = metronom.video_wrap_offset();
        let v1 = metronom.got_video_frame(0, 3600);
        let v2 = metronom.got_video_frame(0, 3600);
        assert_eq!(v2 - v1, 3600);
        assert_eq!(metronom.video_wrap_offset(), wrap_before);
        metronom.shutdown();
    }

    #[test]
    fn test_frame_reorder_is_not_a_discontinuity() {
        let metronom = new_metronom(false);
        for pts in [0i64, 7200, 3600, 14400, 10800] {
            let _ = metronom.got_video_frame(pts, 3600);
        }
        let wrap_before = metronom.video_wrap_offset();
        let vpts_before = metronom.video_vpts();
        // Re-ordered packet: pts lies in the past but well within the wrap
        // threshold. Wrap state must stay untouched.
        let vpts = metronom.got_video_frame(7200, 3600);
        assert_eq!(metronom.video_wrap_offset(), wrap_before);
        // Emitted vpts follows the prediction (with gentle drift pull), not
        // the stale pts.
        assert!((vpts - vpts_before).abs() < VIDEO_DRIFT_TOLERANCE);
        metronom.shutdown();
    }

    #[test]
    fn test_unannounced_jump_ignored() {
        let metronom = new_metronom(false);
        for i in 0..5 {
            metronom.got_video_frame(i * 3600, 3600);
        }
        let wrap_before = metronom.video_wrap_offset();
        let vpts_before = metronom.video_vpts();
        // A wild jump without CONTROL_NEWPTS: treated as reorder noise.
        let vpts = metronom.got_video_frame(9_000_000, 3600);
        assert_eq!(metronom.video_wrap_offset(), wrap_before);
        assert_eq!(vpts, vpts_before);
        metronom.shutdown();
    }

    #[test]
    fn test_announced_discontinuity_aligns_both_streams() {
        let metronom = new_metronom(true);
        for i in 0..5 {
            metronom.got_video_frame(i * 3600, 3600);
            metronom.got_audio_samples(i * 3600, 1920);
        }
        let video_vpts_pre = metronom.video_vpts().max(metronom.audio_vpts());

        // Both workers hit their in-band discontinuity packet; the barrier
        // makes the calls rendezvous.
        let m = metronom.clone();
        let audio = spawn(move || {
            sleep(Duration::from_millis(10));
            m.handle_audio_discontinuity(DiscontinuityKind::Absolute, 0);
        });
        metronom.handle_video_discontinuity(DiscontinuityKind::Absolute, 0);
        audio.join().unwrap();

        assert_eq!(metronom.video_vpts(), metronom.audio_vpts());

        let audio_vpts = metronom.got_audio_samples(1_000_000, 1920);
        let video_vpts = metronom.got_video_frame(1_000_000, 3600);
        assert_eq!(metronom.audio_wrap_offset(), video_vpts_pre - 1_000_000);
        assert_eq!(metronom.video_wrap_offset(), metronom.audio_wrap_offset());
        assert_eq!(audio_vpts, video_vpts_pre);
        assert_eq!(video_vpts, video_vpts_pre);
        metronom.shutdown();
    }

    #[test]
    fn test_wrap_offsets_forced_to_agree() {
        let metronom = new_metronom(true);
        // Desynchronize the offsets through a video-only discontinuity
        // resolution (audio side waits for its packet in real streams; here
        // we adjust it directly through the barrier-free audio path).
        {
            let mut state = metronom.state.lock().unwrap();
            state.video_wrap_offset = 50_000;
            state.audio_wrap_offset = 30_000;
            state.last_video_pts = 0;
        }
        for i in 1..=(MAX_NUM_WRAP_DIFF as i64 + 1) {
            metronom.got_video_frame(i * 3600, 3600);
        }
        assert_eq!(metronom.video_wrap_offset(), 50_000);
        assert_eq!(metronom.audio_wrap_offset(), 50_000);
        metronom.shutdown();
    }

    #[test]
    fn test_audio_sample_accumulation() {
        let metronom = new_metronom(true);
        // 48 kHz: 90000 * 32768 / 48000 ticks per 32768 samples.
        metronom.set_audio_rate(PTS_PER_SECOND * AUDIO_SAMPLE_NUM / 48_000);
        let v0 = metronom.got_audio_samples(3600, 1920);
        let v1 = metronom.got_audio_samples(0, 1920);
        // 1920 samples at 48 kHz are 40 ms = 3600 ticks.
        assert_eq!(v1 - v0, 3600);
        metronom.shutdown();
    }

    #[test]
    fn test_spu_fallback_during_discontinuity_window() {
        let metronom = new_metronom(true);
        assert_eq!(metronom.got_spu_packet(1000), 1000 + PREBUFFER_PTS_OFFSET);

        // Video side entered the window, audio not yet resolved: drop.
        {
            let mut state = metronom.state.lock().unwrap();
            state.video_discontinuity = true;
            state.audio_discontinuity = true;
        }
        assert_eq!(metronom.got_spu_packet(2000), 0);

        // Audio already resolved: borrow its offset.
        {
            let mut state = metronom.state.lock().unwrap();
            state.audio_discontinuity = false;
            state.audio_wrap_offset = 7_000;
        }
        assert_eq!(metronom.got_spu_packet(2000), 9_000);
        metronom.shutdown();
    }

    #[test]
    fn test_master_clock_election_and_speed() {
        let metronom = new_metronom(false);
        metronom.start_clock(0);
        let strict = Arc::new(StrictScr::new());
        strict.start(500_000);
        let strict_dyn: Arc<dyn ScrProvider> = strict.clone();
        metronom.register_scr(strict_dyn.clone());

        // The strict provider outranks the wall clock.
        let now = metronom.get_current_time();
        assert!(now >= 500_000, "now = {now}");

        // Non-adjustable: adjust_clock must not move it.
        metronom.adjust_clock(0);
        assert!(metronom.get_current_time() >= 500_000);

        strict.set_adjustable(true);
        metronom.adjust_clock(0);
        assert!(metronom.get_current_time() < 100_000);

        metronom.unregister_scr(&strict_dyn);
        metronom.shutdown();
    }

    #[test]
    fn test_pause_freezes_clock() {
        let metronom = new_metronom(false);
        metronom.start_clock(10_000);
        metronom.set_speed(Speed::PAUSE);
        let t0 = metronom.get_current_time();
        sleep(Duration::from_millis(30));
        let t1 = metronom.get_current_time();
        assert_eq!(t0, t1);
        metronom.resume_clock();
        sleep(Duration::from_millis(30));
        assert!(metronom.get_current_time() > t1);
        metronom.shutdown();
    }
}
