//! Engine facade: wires the metronom, FIFOs, output stages and decoder
//! workers together and drives them through open/play/seek/stop/eject.

use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc, Mutex,
};

use anyhow::{bail, Result};
use kinema_util::position::PositionTracker;
use tracing::info;

use crate::{
    audio_out::{AudioDriver, AudioOutput},
    buffer::{Control, PacketFifo},
    config::ConfigStore,
    decoder::{
        audio::{self, AudioWorkerContext},
        spu::{self, SpuWorkerContext},
        video::{self, VideoWorkerContext},
        AudioDecoder, ChannelState, DecoderRegistry, SpuDecoder, SpuSink, StreamFlags,
        VideoDecoder,
    },
    demux::{DemuxCallbacks, DemuxOutputs, DemuxStatus, Demuxer, ProbeHint, ProbeResult},
    events::{Event, EventBus, EventQueue, UiEvent},
    input::{InputEventKind, InputSource},
    metronom::{Metronom, Speed},
    overlay::OverlayBuffer,
    video_out::{VideoDriver, VideoOutput},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum EngineStatus {
    Stop,
    Play,
    Quit,
}

struct EngineState {
    status: EngineStatus,
    speed: Speed,
    cur_input: Option<Arc<dyn InputSource>>,
    cur_demuxer: Option<Arc<dyn Demuxer>>,
    cur_mrl: String,
}

struct Workers {
    video: std::thread::JoinHandle<()>,
    audio: std::thread::JoinHandle<()>,
    spu: std::thread::JoinHandle<()>,
}

pub struct Engine {
    metronom: Arc<Metronom>,
    video_fifo: PacketFifo,
    audio_fifo: PacketFifo,
    spu_fifo: PacketFifo,
    video_out: VideoOutput,
    audio_out: AudioOutput,
    overlays: Arc<OverlayBuffer>,
    events: EventBus,
    config: Arc<ConfigStore>,
    video_decoders: Arc<DecoderRegistry<dyn VideoDecoder>>,
    audio_decoders: Arc<DecoderRegistry<dyn AudioDecoder>>,
    spu_decoders: Arc<DecoderRegistry<dyn SpuDecoder>>,
    channels: Arc<ChannelState>,
    position: Arc<PositionTracker>,
    inputs: Mutex<Vec<Arc<dyn InputSource>>>,
    demuxers: Mutex<Vec<Arc<dyn Demuxer>>>,
    state: Mutex<EngineState>,
    workers: Mutex<Option<Workers>>,
    shut: AtomicBool,
}

impl Engine {
    pub fn new(
        video_driver: Box<dyn VideoDriver>,
        audio_driver: Option<Box<dyn AudioDriver>>,
        config: Arc<ConfigStore>,
    ) -> Engine {
        let have_audio = audio_driver.is_some();
        let metronom = Metronom::new(have_audio);
        let events = EventBus::new();
        let overlays = Arc::new(OverlayBuffer::new());
        let flags = Arc::new(StreamFlags::new(have_audio));
        let channels = Arc::new(ChannelState::new());
        let position = Arc::new(PositionTracker::default());

        let video_fifo = PacketFifo::new_video();
        let audio_fifo = PacketFifo::new_audio();
        let spu_fifo = PacketFifo::new_spu();

        let video_out = VideoOutput::new(video_driver, metronom.clone());
        video_out.register_overlay_source(overlays.clone());
        video_out.set_event_bus(events.clone());
        video_out.open();
        let audio_out = AudioOutput::new(audio_driver, metronom.clone());

        let video_decoders: Arc<DecoderRegistry<dyn VideoDecoder>> =
            Arc::new(DecoderRegistry::new());
        let audio_decoders: Arc<DecoderRegistry<dyn AudioDecoder>> =
            Arc::new(DecoderRegistry::new());
        let spu_decoders: Arc<DecoderRegistry<dyn SpuDecoder>> = Arc::new(DecoderRegistry::new());

        let workers = Workers {
            video: video::spawn(VideoWorkerContext {
                fifo: video_fifo.clone(),
                registry: video_decoders.clone(),
                metronom: metronom.clone(),
                output: video_out.clone(),
                events: events.clone(),
                flags: flags.clone(),
                position: position.clone(),
            }),
            audio: audio::spawn(AudioWorkerContext {
                fifo: audio_fifo.clone(),
                registry: audio_decoders.clone(),
                metronom: metronom.clone(),
                output: audio_out.clone(),
                events: events.clone(),
                flags: flags.clone(),
                position: position.clone(),
                channels: channels.clone(),
            }),
            spu: spu::spawn(SpuWorkerContext {
                fifo: spu_fifo.clone(),
                registry: spu_decoders.clone(),
                sink: SpuSink::new(metronom.clone(), overlays.clone()),
                events: events.clone(),
                position: position.clone(),
                channels: channels.clone(),
            }),
        };

        info!(have_audio, "engine initialized");

        Engine {
            metronom,
            video_fifo,
            audio_fifo,
            spu_fifo,
            video_out,
            audio_out,
            overlays,
            events,
            config,
            video_decoders,
            audio_decoders,
            spu_decoders,
            channels,
            position,
            inputs: Mutex::new(Vec::new()),
            demuxers: Mutex::new(Vec::new()),
            state: Mutex::new(EngineState {
                status: EngineStatus::Stop,
                speed: Speed::PAUSE,
                cur_input: None,
                cur_demuxer: None,
                cur_mrl: String::new(),
            }),
            workers: Mutex::new(Some(workers)),
            shut: AtomicBool::new(false),
        }
    }

    // ---- collaborator registration --------------------------------------

    pub fn register_input(&self, input: Arc<dyn InputSource>) {
        self.inputs.lock().unwrap().push(input);
    }

    pub fn register_demuxer(&self, demuxer: Arc<dyn Demuxer>) {
        self.demuxers.lock().unwrap().push(demuxer);
    }

    pub fn video_decoders(&self) -> &Arc<DecoderRegistry<dyn VideoDecoder>> {
        &self.video_decoders
    }

    pub fn audio_decoders(&self) -> &Arc<DecoderRegistry<dyn AudioDecoder>> {
        &self.audio_decoders
    }

    pub fn spu_decoders(&self) -> &Arc<DecoderRegistry<dyn SpuDecoder>> {
        &self.spu_decoders
    }

    // ---- playback control -----------------------------------------------

    /// Open `mrl` and start playing from `start_pos` (0..=65535 share of
    /// the source) or `start_time_ms`, whichever the demuxer honors.
    pub fn play(&self, mrl: &str, start_pos: u16, start_time_ms: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        info!(mrl, start_pos, start_time_ms, "play");

        if state.status == EngineStatus::Play {
            if let Some(demuxer) = state.cur_demuxer.take() {
                demuxer.stop();
            }
            if let Some(input) = state.cur_input.take() {
                input.close();
            }
            state.status = EngineStatus::Stop;
        }

        let input = {
            let inputs = self.inputs.lock().unwrap();
            inputs.iter().find(|input| input.open(mrl)).cloned()
        };
        let Some(input) = input else {
            self.events
                .send(Event::Diagnostic(format!("no input source for {mrl}")));
            bail!("no input source accepts mrl {mrl}");
        };

        let demuxer = {
            let demuxers = self.demuxers.lock().unwrap();
            demuxers
                .iter()
                .find(|d| d.probe(&input, ProbeHint::Content) == ProbeResult::Accept)
                .or_else(|| {
                    demuxers
                        .iter()
                        .find(|d| d.probe(&input, ProbeHint::Extension) == ProbeResult::Accept)
                })
                .cloned()
        };
        let Some(demuxer) = demuxer else {
            input.close();
            self.events
                .send(Event::Diagnostic(format!("no demuxer for {mrl}")));
            bail!("no demuxer accepts mrl {mrl}");
        };
        info!(demuxer = demuxer.identifier(), "demuxer selected");

        self.position.reset();
        self.position.record_len(input.length());
        let pos = share_to_bytes(start_pos, input.length());

        // Stream start travels in-band so both decoder sides rendezvous at
        // the barrier before any data.
        self.video_fifo.post_control(Control::Start);
        self.audio_fifo.post_control(Control::Start);
        self.spu_fifo.post_control(Control::Start);

        let outputs = DemuxOutputs {
            video: self.video_fifo.clone(),
            audio: self.audio_fifo.clone(),
            spu: self.spu_fifo.clone(),
        };
        if let Err(e) = demuxer.start(
            input.clone(),
            outputs,
            pos,
            start_time_ms,
            DemuxCallbacks::default(),
        ) {
            input.close();
            self.events
                .send(Event::Diagnostic(format!("demuxer failed to start: {e}")));
            bail!("demuxer failed to start: {e}");
        }
        if demuxer.status() != DemuxStatus::Ok {
            input.close();
            self.events
                .send(Event::Diagnostic("demuxer failed to start".into()));
            bail!("demuxer reported failure after start");
        }

        state.cur_mrl = mrl.to_string();
        state.cur_input = Some(input);
        state.cur_demuxer = Some(demuxer);
        state.status = EngineStatus::Play;
        self.apply_speed(&mut state, Speed::NORMAL);
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.status != EngineStatus::Play {
            return;
        }
        info!("stop");
        self.apply_speed(&mut state, Speed::NORMAL);
        if let Some(demuxer) = state.cur_demuxer.take() {
            demuxer.stop();
        }
        if let Some(input) = &state.cur_input {
            // Kept around (closed) so eject still works after stop.
            input.close();
        }
        state.status = EngineStatus::Stop;
    }

    /// Restart the running demuxer at a new position.
    pub fn seek(&self, pos: u16) -> Result<()> {
        let state = self.state.lock().unwrap();
        if state.status != EngineStatus::Play {
            bail!("seek while not playing");
        }
        let (Some(input), Some(demuxer)) = (state.cur_input.clone(), state.cur_demuxer.clone())
        else {
            bail!("seek without an open stream");
        };
        info!(pos, "seek");
        demuxer.stop();
        // Flush stale packets; the demuxer announces the new timeline with
        // an in-band NEWPTS/seek control.
        self.video_fifo.clear();
        self.audio_fifo.clear();
        self.spu_fifo.clear();
        self.overlays.clear();
        let outputs = DemuxOutputs {
            video: self.video_fifo.clone(),
            audio: self.audio_fifo.clone(),
            spu: self.spu_fifo.clone(),
        };
        let byte_pos = share_to_bytes(pos, input.length());
        demuxer.start(input, outputs, byte_pos, 0, DemuxCallbacks::default())
    }

    pub fn pause(&self, paused: bool) {
        self.set_speed(if paused { Speed::PAUSE } else { Speed::NORMAL });
    }

    pub fn set_speed(&self, speed: Speed) {
        let mut state = self.state.lock().unwrap();
        self.apply_speed(&mut state, speed.clamped());
    }

    fn apply_speed(&self, state: &mut EngineState, speed: Speed) {
        let true_speed = self.metronom.set_speed(speed);
        state.speed = true_speed;
        let mute = match true_speed {
            Speed::PAUSE => 2,
            Speed::NORMAL => 0,
            _ => 1,
        };
        self.audio_out.set_mute_level(mute);
    }

    pub fn speed(&self) -> Speed {
        self.state.lock().unwrap().speed
    }

    pub fn set_av_offset(&self, offset: i64) {
        self.metronom.set_av_offset(offset);
    }

    pub fn av_offset(&self) -> i64 {
        self.metronom.get_av_offset()
    }

    /// Channel switches travel in-band so they stay ordered with the
    /// packets around them.
    pub fn select_audio_channel(&self, channel: i32) {
        self.audio_fifo
            .post_control(Control::AudioChannel { channel: channel.max(0) });
    }

    pub fn select_spu_channel(&self, channel: i32) {
        self.spu_fifo
            .post_control(Control::SpuChannel { channel: channel.max(-1) });
    }

    pub fn audio_channel(&self) -> i32 {
        self.channels.audio.load(Relaxed)
    }

    pub fn spu_channel(&self) -> i32 {
        self.channels.spu.load(Relaxed)
    }

    pub fn eject(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.status != EngineStatus::Stop {
            return false;
        }
        match &state.cur_input {
            Some(input) => input.eject(),
            None => false,
        }
    }

    // ---- introspection --------------------------------------------------

    pub fn status(&self) -> EngineStatus {
        self.state.lock().unwrap().status
    }

    pub fn mrl(&self) -> String {
        self.state.lock().unwrap().cur_mrl.clone()
    }

    /// Position inside the source as a 0..=65535 share.
    pub fn current_position(&self) -> u16 {
        self.position.share()
    }

    pub fn current_time_ms(&self) -> u64 {
        self.position.millis()
    }

    pub fn stream_length_ms(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .cur_demuxer
            .as_ref()
            .map(|d| d.stream_length_ms())
            .unwrap_or(0)
    }

    pub fn event_queue(&self) -> EventQueue {
        self.events.new_queue()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn metronom(&self) -> &Arc<Metronom> {
        &self.metronom
    }

    pub fn video_output(&self) -> &VideoOutput {
        &self.video_out
    }

    pub fn audio_output(&self) -> &AudioOutput {
        &self.audio_out
    }

    /// Forward an opaque UI event to the current input source (disc menus).
    pub fn send_ui_event(&self, event: UiEvent) {
        let input = self.state.lock().unwrap().cur_input.clone();
        let Some(input) = input else {
            return;
        };
        match event {
            UiEvent::MouseButton { button, x, y } => {
                input.handle_input_event(InputEventKind::MouseButton, button, x, y);
            }
            UiEvent::MouseMove { x, y } => {
                input.handle_input_event(InputEventKind::MouseMove, 0, x, y);
            }
            UiEvent::KeyPress(key) => {
                input.handle_input_event(InputEventKind::KeyDown, key, 0, 0);
            }
        }
    }

    /// Cooperative teardown: display loop first, then the decoder workers
    /// in video, audio, spu order, the audio device, and finally the clock
    /// helper. Also runs on drop.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Relaxed) {
            return;
        }
        info!("engine shutdown");
        {
            let mut state = self.state.lock().unwrap();
            if let Some(demuxer) = state.cur_demuxer.take() {
                demuxer.stop();
            }
            if let Some(input) = state.cur_input.take() {
                input.close();
            }
            self.apply_speed(&mut state, Speed::NORMAL);
            state.status = EngineStatus::Quit;
        }

        // Drop pending packets first so no worker can wedge itself against
        // the stopping display loop, and disarm the discontinuity barrier:
        // a worker whose peer already quit must not wait there forever.
        self.video_fifo.clear();
        self.audio_fifo.clear();
        self.spu_fifo.clear();
        self.metronom.interrupt_barrier();

        self.video_out.close();

        let workers = self.workers.lock().unwrap().take();
        if let Some(workers) = workers {
            self.video_fifo.post_control(Control::Quit);
            let _ = workers.video.join();
            self.video_out.drain_display();

            self.audio_fifo.post_control(Control::Quit);
            let _ = workers.audio.join();

            self.spu_fifo.post_control(Control::Quit);
            let _ = workers.spu.join();
        }

        self.audio_out.close();
        self.metronom.shutdown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn share_to_bytes(share: u16, length: u64) -> u64 {
    (length as u128 * share as u128 / 65535) as u64
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::video_out::{
        alloc_planes, AspectCode, DriverCaps, FrameData, FrameFormat, NUM_FRAME_BUFFERS,
    };

    struct NullVideoDriver;

    impl VideoDriver for NullVideoDriver {
        fn capabilities(&self) -> DriverCaps {
            DriverCaps::YV12
        }
        fn update_frame_format(
            &self,
            frame: &mut FrameData,
            width: u32,
            height: u32,
            _ratio: AspectCode,
            format: FrameFormat,
        ) -> Result<()> {
            alloc_planes(frame, width, height, format);
            Ok(())
        }
        fn display_frame(&self, frame: crate::video_out::Frame) -> Result<()> {
            frame.displayed();
            Ok(())
        }
    }

    struct StaticInput {
        accept: &'static str,
        ejected: AtomicBool,
    }

    impl InputSource for StaticInput {
        fn open(&self, mrl: &str) -> bool {
            mrl.starts_with(self.accept)
        }
        fn read(&self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
        fn seek(&self, _target: std::io::SeekFrom) -> Result<u64> {
            Ok(0)
        }
        fn length(&self) -> u64 {
            1 << 20
        }
        fn mrl(&self) -> String {
            self.accept.to_string()
        }
        fn eject(&self) -> bool {
            self.ejected.store(true, Relaxed);
            true
        }
        fn close(&self) {}
    }

    /// Demuxer that produces nothing; start/stop bookkeeping only.
    struct IdleDemuxer {
        starts: AtomicU32,
        stops: AtomicU32,
    }

    impl IdleDemuxer {
        fn new() -> Arc<IdleDemuxer> {
            Arc::new(IdleDemuxer {
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
            })
        }
    }

    impl Demuxer for Arc<IdleDemuxer> {
        fn identifier(&self) -> &'static str {
            "idle"
        }
        fn probe(&self, _input: &Arc<dyn InputSource>, hint: ProbeHint) -> ProbeResult {
            match hint {
                ProbeHint::Content => ProbeResult::Accept,
                ProbeHint::Extension => ProbeResult::Reject,
            }
        }
        fn start(
            &self,
            _input: Arc<dyn InputSource>,
            _outputs: DemuxOutputs,
            _pos: u64,
            _start_time_ms: u64,
            _callbacks: DemuxCallbacks,
        ) -> Result<()> {
            self.starts.fetch_add(1, Relaxed);
            Ok(())
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Relaxed);
        }
        fn status(&self) -> DemuxStatus {
            DemuxStatus::Ok
        }
    }

    fn engine() -> Engine {
        kinema_util::log::init();
        Engine::new(
            Box::new(NullVideoDriver),
            None,
            Arc::new(ConfigStore::new()),
        )
    }

    #[test]
    fn test_play_without_input_fails_cleanly() {
        let engine = engine();
        let queue = engine.event_queue();
        assert!(engine.play("file:///nope", 0, 0).is_err());
        assert_eq!(engine.status(), EngineStatus::Stop);
        assert!(matches!(queue.wait().event, Event::Diagnostic(_)));
        engine.shutdown();
    }

    #[test]
    fn test_play_stop_cycle() {
        let engine = engine();
        engine.register_input(Arc::new(StaticInput {
            accept: "file://",
            ejected: AtomicBool::new(false),
        }));
        let demuxer = IdleDemuxer::new();
        engine.register_demuxer(Arc::new(demuxer.clone()));

        engine.play("file:///movie.mpg", 0, 0).unwrap();
        assert_eq!(engine.status(), EngineStatus::Play);
        assert_eq!(engine.speed(), Speed::NORMAL);
        assert_eq!(demuxer.starts.load(Relaxed), 1);

        engine.stop();
        assert_eq!(engine.status(), EngineStatus::Stop);
        assert_eq!(demuxer.stops.load(Relaxed), 1);
        engine.shutdown();
    }

    #[test]
    fn test_stop_play_equals_fresh_play() {
        let engine = engine();
        engine.register_input(Arc::new(StaticInput {
            accept: "file://",
            ejected: AtomicBool::new(false),
        }));
        let demuxer = IdleDemuxer::new();
        engine.register_demuxer(Arc::new(demuxer.clone()));

        engine.play("file:///movie.mpg", 0, 0).unwrap();
        engine.stop();
        engine.play("file:///movie.mpg", 0, 0).unwrap();

        assert_eq!(engine.status(), EngineStatus::Play);
        assert_eq!(engine.speed(), Speed::NORMAL);
        assert_eq!(engine.mrl(), "file:///movie.mpg");
        engine.shutdown();
    }

    #[test]
    fn test_play_while_playing_restarts() {
        let engine = engine();
        engine.register_input(Arc::new(StaticInput {
            accept: "file://",
            ejected: AtomicBool::new(false),
        }));
        let demuxer = IdleDemuxer::new();
        engine.register_demuxer(Arc::new(demuxer.clone()));

        engine.play("file:///one.mpg", 0, 0).unwrap();
        engine.play("file:///two.mpg", 0, 0).unwrap();
        assert_eq!(demuxer.starts.load(Relaxed), 2);
        assert_eq!(demuxer.stops.load(Relaxed), 1);
        assert_eq!(engine.mrl(), "file:///two.mpg");
        engine.shutdown();
    }

    #[test]
    fn test_pause_is_play_at_speed_zero() {
        let engine = engine();
        engine.register_input(Arc::new(StaticInput {
            accept: "file://",
            ejected: AtomicBool::new(false),
        }));
        engine.register_demuxer(Arc::new(IdleDemuxer::new()));

        engine.play("file:///movie.mpg", 0, 0).unwrap();
        engine.pause(true);
        assert_eq!(engine.status(), EngineStatus::Play);
        assert_eq!(engine.speed(), Speed::PAUSE);
        engine.pause(false);
        assert_eq!(engine.speed(), Speed::NORMAL);
        engine.shutdown();
    }

    #[test]
    fn test_eject_only_when_stopped() {
        let engine = engine();
        let input = Arc::new(StaticInput {
            accept: "file://",
            ejected: AtomicBool::new(false),
        });
        engine.register_input(input.clone());
        engine.register_demuxer(Arc::new(IdleDemuxer::new()));

        assert!(!engine.eject());
        engine.play("file:///movie.mpg", 0, 0).unwrap();
        assert!(!engine.eject());
        engine.stop();
        assert!(engine.eject());
        assert!(input.ejected.load(Relaxed));
        engine.shutdown();
    }

    #[test]
    fn test_seek_requires_playback() {
        let engine = engine();
        assert!(engine.seek(100).is_err());
        engine.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent_and_conserves_frames() {
        let engine = engine();
        engine.shutdown();
        engine.shutdown();
        assert_eq!(engine.status(), EngineStatus::Quit);
        assert_eq!(engine.video_output().free_len(), NUM_FRAME_BUFFERS);
    }
}
