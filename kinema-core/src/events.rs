//! Publish/subscribe event delivery towards the embedding UI.
//!
//! Every subscriber owns a bounded queue; `send` copies the event into each
//! of them and stamps the publish time. A subscriber may attach a listener
//! thread that loops wait -> callback. Disposing a queue posts a `Quit`
//! sentinel to itself, joins the listener and unlinks from the bus.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, RwLock, Weak},
    thread::JoinHandle,
    time::SystemTime,
};

use tracing::{debug, warn};

use crate::{
    buffer::StreamClass,
    video_out::AspectCode,
};

/// Per-subscriber backlog; beyond this the oldest event is dropped so the
/// most recent state change always gets through.
const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub enum UiEvent {
    KeyPress(u32),
    MouseButton { button: u32, x: i32, y: i32 },
    MouseMove { x: i32, y: i32 },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    StreamFinished,
    ChannelsChanged,
    VideoOutputChanged(String),
    NoVideo(String),
    FrameFormatChange {
        width: u32,
        height: u32,
        aspect: AspectCode,
    },
    CodecChanged {
        class: StreamClass,
        old: Option<u32>,
        new: Option<u32>,
        handled: bool,
    },
    Diagnostic(String),
    Ui(UiEvent),
    Quit,
}

/// An event as delivered to a subscriber, stamped at publish time.
#[derive(Clone, Debug)]
pub struct QueuedEvent {
    pub time: SystemTime,
    pub event: Event,
}

struct QueueShared {
    queue: Mutex<VecDeque<QueuedEvent>>,
    new_event: Condvar,
}

impl QueueShared {
    fn push(&self, event: QueuedEvent) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= EVENT_QUEUE_CAPACITY {
            warn!("event queue full, dropping oldest event");
            queue.pop_front();
        }
        queue.push_back(event);
        self.new_event.notify_one();
    }

    fn wait(&self) -> QueuedEvent {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(event) = queue.pop_front() {
                return event;
            }
            queue = self.new_event.wait(queue).unwrap();
        }
    }

    fn try_get(&self) -> Option<QueuedEvent> {
        self.queue.lock().unwrap().pop_front()
    }
}

struct BusShared {
    queues: RwLock<Vec<Arc<QueueShared>>>,
}

/// Handle to the engine's event bus. Cheap to clone; workers hold clones to
/// publish from any thread.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus {
            shared: Arc::new(BusShared {
                queues: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Copy `event` into every subscriber queue.
    pub fn send(&self, event: Event) {
        let time = SystemTime::now();
        let queues = self.shared.queues.read().unwrap();
        for queue in queues.iter() {
            queue.push(QueuedEvent {
                time,
                event: event.clone(),
            });
        }
    }

    /// Create a new subscriber queue.
    pub fn new_queue(&self) -> EventQueue {
        let shared = Arc::new(QueueShared {
            queue: Mutex::new(VecDeque::new()),
            new_event: Condvar::new(),
        });
        self.shared.queues.write().unwrap().push(shared.clone());
        EventQueue {
            shared,
            bus: Arc::downgrade(&self.shared),
            listener: None,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.queues.read().unwrap().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's bounded event queue.
pub struct EventQueue {
    shared: Arc<QueueShared>,
    bus: Weak<BusShared>,
    listener: Option<JoinHandle<()>>,
}

impl EventQueue {
    /// Block until an event arrives.
    pub fn wait(&self) -> QueuedEvent {
        self.shared.wait()
    }

    pub fn try_get(&self) -> Option<QueuedEvent> {
        self.shared.try_get()
    }

    /// Attach a listener thread looping wait -> callback until `Quit`.
    pub fn start_listener(&mut self, callback: impl Fn(QueuedEvent) + Send + 'static) {
        if self.listener.is_some() {
            warn!("event queue already has a listener");
            return;
        }
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("event-listener".into())
            .spawn(move || loop {
                let event = shared.wait();
                if event.event == Event::Quit {
                    debug!("event listener quitting");
                    return;
                }
                callback(event);
            })
            .expect("failed to spawn event listener thread");
        self.listener = Some(handle);
    }

    /// Unlink from the bus, stop the listener and drain leftovers. Also runs
    /// on drop.
    pub fn dispose(mut self) {
        self.dispose_inner();
    }

    fn dispose_inner(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            let mut queues = bus.queues.write().unwrap();
            queues.retain(|q| !Arc::ptr_eq(q, &self.shared));
        }
        self.shared.push(QueuedEvent {
            time: SystemTime::now(),
            event: Event::Quit,
        });
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
        while self.shared.try_get().is_some() {}
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.dispose_inner();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering::Relaxed},
        thread::sleep,
        time::{Duration, Instant},
    };

    use super::*;

    #[test]
    fn test_every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let q1 = bus.new_queue();
        let q2 = bus.new_queue();

        bus.send(Event::StreamFinished);
        bus.send(Event::ChannelsChanged);

        for queue in [&q1, &q2] {
            assert_eq!(queue.wait().event, Event::StreamFinished);
            assert_eq!(queue.wait().event, Event::ChannelsChanged);
            assert!(queue.try_get().is_none());
        }
    }

    #[test]
    fn test_events_are_timestamped() {
        let bus = EventBus::new();
        let queue = bus.new_queue();
        let before = SystemTime::now();
        bus.send(Event::StreamFinished);
        let event = queue.wait();
        assert!(event.time >= before);
        assert!(event.time <= SystemTime::now());
    }

    #[test]
    fn test_wait_blocks_until_send() {
        let bus = EventBus::new();
        let queue = bus.new_queue();
        let bus2 = bus.clone();
        let sender = std::thread::spawn(move || {
            sleep(Duration::from_millis(20));
            bus2.send(Event::StreamFinished);
        });
        assert_eq!(queue.wait().event, Event::StreamFinished);
        sender.join().unwrap();
    }

    #[test]
    fn test_listener_runs_callback_and_joins_on_dispose() {
        let bus = EventBus::new();
        let mut queue = bus.new_queue();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        queue.start_listener(move |event| {
            assert!(event.event != Event::Quit);
            hits2.fetch_add(1, Relaxed);
        });

        bus.send(Event::StreamFinished);
        bus.send(Event::ChannelsChanged);

        let deadline = Instant::now() + Duration::from_secs(1);
        while hits.load(Relaxed) < 2 && Instant::now() < deadline {
            sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Relaxed), 2);

        queue.dispose();
        assert_eq!(bus.subscriber_count(), 0);
        // A later send must not reach the disposed queue.
        bus.send(Event::StreamFinished);
        assert_eq!(hits.load(Relaxed), 2);
    }

    #[test]
    fn test_queue_bounded_drops_oldest() {
        let bus = EventBus::new();
        let queue = bus.new_queue();
        for i in 0..EVENT_QUEUE_CAPACITY + 10 {
            bus.send(Event::Diagnostic(format!("event {i}")));
        }
        // The oldest events fell off the front.
        let first = queue.wait();
        assert_eq!(first.event, Event::Diagnostic("event 10".into()));
    }

    #[test]
    fn test_drop_unlinks_from_bus() {
        let bus = EventBus::new();
        {
            let _queue = bus.new_queue();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }
}
