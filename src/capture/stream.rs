//! Kernel Event Translation
//!
//! Reads raw evdev events from one opened device and turns them into
//! canonical events. Translation follows the kernel's event grammar:
//! relative X/Y deltas accumulate until the device's synchronization report
//! closes the packet, so one canonical motion event comes out per hardware
//! report no matter how the deltas were split. Wheel detents arrive as
//! discrete REL_WHEEL/REL_HWHEEL units; high-resolution wheel codes are
//! dropped because the discrete code for the same detent is also delivered
//! and forwarding both would double-scroll.
//!
//! Captured events land in a bounded queue shared by all device tasks.
//! When a consumer stalls, the oldest queued events are dropped first so
//! the stream stays current (a relay that replays stale motion feels
//! broken in a way lost motion does not).

use evdev::{EventType, InputEvent, RelativeAxisType};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::UNIX_EPOCH;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::device::{GrabState, GrabTracker};
use super::CaptureError;
use crate::protocol::{Event, ScrollAxis};

/// Wayland-convention axis units emitted per wheel detent.
const SCROLL_UNITS_PER_DETENT: f64 = 15.0;

/// First evdev code of the button range (BTN_MISC).
const BTN_RANGE_START: u16 = 0x100;
/// End of the button range used for pointer buttons (BTN_GEAR_UP).
const BTN_RANGE_END: u16 = 0x151;

// ---------------------------------------------------------------------------
// Bounded drop-oldest queue
// ---------------------------------------------------------------------------

/// Bounded multi-producer event queue with drop-oldest overflow.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

struct QueueInner {
    events: VecDeque<Event>,
    dropped: u64,
}

impl EventQueue {
    /// Queue holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                events: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue an event, evicting the oldest entry when full.
    pub fn push(&self, event: Event) {
        {
            let mut inner = self.inner.lock().expect("event queue poisoned");
            if inner.events.len() == self.capacity {
                inner.events.pop_front();
                inner.dropped += 1;
                // Log once per 100 evictions; a wedged consumer would
                // otherwise flood the log at input rate.
                if inner.dropped % 100 == 1 {
                    warn!(
                        dropped = inner.dropped,
                        "capture backpressure: consumer lagging, dropping oldest events"
                    );
                }
            }
            inner.events.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Dequeue the oldest event, waiting until one is available.
    pub async fn pop(&self) -> Event {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.try_pop() {
                return event;
            }
            notified.await;
        }
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<Event> {
        self.inner
            .lock()
            .expect("event queue poisoned")
            .events
            .pop_front()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("event queue poisoned").events.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events evicted due to overflow.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("event queue poisoned").dropped
    }
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// Per-device translation state: relative deltas accumulated between
/// synchronization reports.
#[derive(Debug, Default)]
pub struct Translator {
    pending_dx: i32,
    pending_dy: i32,
}

impl Translator {
    /// New translator with no pending motion.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one kernel event; returns the canonical event it completes, if
    /// any. Motion is only emitted at the synchronization boundary.
    pub fn translate(&mut self, event: &InputEvent) -> Option<Event> {
        let timestamp_us = event_time_us(event);
        match event.event_type() {
            EventType::RELATIVE => self.translate_relative(event, timestamp_us),
            EventType::KEY => translate_key(event, timestamp_us),
            EventType::SYNCHRONIZATION => self.flush_motion(timestamp_us),
            _ => None,
        }
    }

    fn translate_relative(&mut self, event: &InputEvent, timestamp_us: u64) -> Option<Event> {
        let axis = RelativeAxisType(event.code());
        match axis {
            RelativeAxisType::REL_X => {
                self.pending_dx += event.value();
                None
            }
            RelativeAxisType::REL_Y => {
                self.pending_dy += event.value();
                None
            }
            RelativeAxisType::REL_WHEEL => Some(Event::MouseScroll {
                axis: ScrollAxis::Vertical,
                // Kernel wheel-up is positive; axis convention is
                // positive-down, so the sign flips.
                value: -f64::from(event.value()) * SCROLL_UNITS_PER_DETENT,
                steps: Some(-event.value()),
                timestamp_us,
            }),
            RelativeAxisType::REL_HWHEEL => Some(Event::MouseScroll {
                axis: ScrollAxis::Horizontal,
                value: f64::from(event.value()) * SCROLL_UNITS_PER_DETENT,
                steps: Some(event.value()),
                timestamp_us,
            }),
            // The discrete detent code above carries the same motion.
            RelativeAxisType::REL_WHEEL_HI_RES | RelativeAxisType::REL_HWHEEL_HI_RES => None,
            _ => {
                trace!(code = event.code(), "ignoring unsupported relative axis");
                None
            }
        }
    }

    fn flush_motion(&mut self, timestamp_us: u64) -> Option<Event> {
        if self.pending_dx == 0 && self.pending_dy == 0 {
            return None;
        }
        let event = Event::MouseMove {
            dx: std::mem::take(&mut self.pending_dx),
            dy: std::mem::take(&mut self.pending_dy),
            timestamp_us,
        };
        Some(event)
    }
}

fn translate_key(event: &InputEvent, timestamp_us: u64) -> Option<Event> {
    // Kernel autorepeat; the receiving session applies its own repeat.
    if event.value() == 2 {
        return None;
    }
    let pressed = event.value() != 0;
    let code = event.code();
    if (BTN_RANGE_START..=BTN_RANGE_END).contains(&code) {
        Some(Event::MouseButton {
            button: code,
            pressed,
            timestamp_us,
        })
    } else if code < BTN_RANGE_START {
        Some(Event::Key {
            code,
            pressed,
            timestamp_us,
        })
    } else {
        trace!(code, "ignoring key outside keyboard and button ranges");
        None
    }
}

/// Kernel event time in microseconds; falls back to the process monotonic
/// clock when the kernel timestamp is unusable.
fn event_time_us(event: &InputEvent) -> u64 {
    match event.timestamp().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_micros() as u64,
        Err(_) => monotonic_us(),
    }
}

fn monotonic_us() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

// ---------------------------------------------------------------------------
// Per-device read task
// ---------------------------------------------------------------------------

/// Drive one opened device until shutdown or an unrecoverable device error.
///
/// The task owns the kernel handle. It applies grab transitions signalled
/// on `grab_rx` (true while routing points at a remote client), translates
/// events into `queue`, and surfaces failures on `errors`. On a read error
/// the device drops back to the ungrabbed state, the error is reported and
/// the task ends; other devices are unaffected.
pub(super) async fn run_device(
    device: evdev::Device,
    stable_id: String,
    mut grab_rx: watch::Receiver<bool>,
    queue: std::sync::Arc<EventQueue>,
    errors: tokio::sync::mpsc::UnboundedSender<CaptureError>,
    shutdown: CancellationToken,
) {
    let mut stream = match device.into_event_stream() {
        Ok(stream) => stream,
        Err(source) => {
            let _ = errors.send(CaptureError::Io {
                id: stable_id,
                source,
            });
            return;
        }
    };

    let mut tracker = GrabTracker::new(stable_id.clone());
    let mut translator = Translator::new();

    // The routing state may already point at a remote by the time this
    // task starts; apply the current wish before reading.
    apply_grab_wish(&mut tracker, &mut stream, *grab_rx.borrow(), &errors);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                break;
            }

            changed = grab_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let wanted = *grab_rx.borrow();
                apply_grab_wish(&mut tracker, &mut stream, wanted, &errors);
            }

            event = stream.next_event() => {
                match event {
                    Ok(event) => {
                        if let Some(canonical) = translator.translate(&event) {
                            queue.push(canonical);
                        }
                    }
                    Err(source) => {
                        error!(id = %stable_id, error = %source, "device read failed, dropping device");
                        if tracker.state() == GrabState::Grabbed {
                            let _ = tracker.ungrab(stream.device_mut());
                        }
                        let _ = errors.send(CaptureError::Io { id: stable_id, source });
                        return;
                    }
                }
            }
        }
    }

    // Shutdown path: never leave a grab behind.
    if tracker.state() == GrabState::Grabbed {
        let _ = tracker.ungrab(stream.device_mut());
    }
    debug!(id = %stable_id, "device task stopped");
}

fn apply_grab_wish(
    tracker: &mut GrabTracker,
    stream: &mut evdev::EventStream,
    wanted: bool,
    errors: &tokio::sync::mpsc::UnboundedSender<CaptureError>,
) {
    let result = if wanted {
        tracker.grab(stream.device_mut())
    } else {
        tracker.ungrab(stream.device_mut())
    };
    if let Err(e) = result {
        warn!(error = %e, "grab transition failed");
        let _ = errors.send(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::{EventType, InputEvent};

    fn ev(type_: EventType, code: u16, value: i32) -> InputEvent {
        InputEvent::new(type_, code, value)
    }

    #[test]
    fn motion_coalesces_to_sync_boundary() {
        let mut t = Translator::new();
        assert!(t.translate(&ev(EventType::RELATIVE, 0, 3)).is_none()); // REL_X
        assert!(t.translate(&ev(EventType::RELATIVE, 1, -2)).is_none()); // REL_Y
        assert!(t.translate(&ev(EventType::RELATIVE, 0, 4)).is_none()); // REL_X again
        match t.translate(&ev(EventType::SYNCHRONIZATION, 0, 0)) {
            Some(Event::MouseMove { dx: 7, dy: -2, .. }) => {}
            other => panic!("expected coalesced MouseMove, got {other:?}"),
        }
        // Next sync with no pending motion emits nothing.
        assert!(t.translate(&ev(EventType::SYNCHRONIZATION, 0, 0)).is_none());
    }

    #[test]
    fn wheel_translates_to_discrete_scroll() {
        let mut t = Translator::new();
        match t.translate(&ev(EventType::RELATIVE, 8, 1)) {
            // REL_WHEEL up: negative axis value, one upward detent.
            Some(Event::MouseScroll {
                axis: ScrollAxis::Vertical,
                value,
                steps: Some(-1),
                ..
            }) => assert_eq!(value, -SCROLL_UNITS_PER_DETENT),
            other => panic!("expected vertical scroll, got {other:?}"),
        }
    }

    #[test]
    fn hi_res_wheel_is_not_double_emitted() {
        let mut t = Translator::new();
        // REL_WHEEL_HI_RES = 0x0b
        assert!(t.translate(&ev(EventType::RELATIVE, 0x0b, 120)).is_none());
    }

    #[test]
    fn keys_and_buttons_split_by_code_range() {
        let mut t = Translator::new();
        match t.translate(&ev(EventType::KEY, 30, 1)) {
            Some(Event::Key {
                code: 30,
                pressed: true,
                ..
            }) => {}
            other => panic!("expected Key, got {other:?}"),
        }
        match t.translate(&ev(EventType::KEY, 272, 0)) {
            Some(Event::MouseButton {
                button: 272,
                pressed: false,
                ..
            }) => {}
            other => panic!("expected MouseButton, got {other:?}"),
        }
    }

    #[test]
    fn autorepeat_is_dropped() {
        let mut t = Translator::new();
        assert!(t.translate(&ev(EventType::KEY, 30, 2)).is_none());
    }

    #[tokio::test]
    async fn queue_drops_oldest_on_overflow() {
        let queue = EventQueue::new(2);
        for i in 0..4 {
            queue.push(Event::Key {
                code: i,
                pressed: true,
                timestamp_us: u64::from(i),
            });
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 2);
        match queue.pop().await {
            Event::Key { code: 2, .. } => {}
            other => panic!("expected oldest surviving event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn queue_pop_waits_for_push() {
        let queue = std::sync::Arc::new(EventQueue::new(8));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(Event::Key {
            code: 1,
            pressed: true,
            timestamp_us: 0,
        });
        match popper.await.unwrap() {
            Event::Key { code: 1, .. } => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
}
