//! Virtual Pointer
//!
//! Wrapper around `zwlr_virtual_pointer_v1`. Motion is relative only —
//! deltas straight from the server's mouse — and every logical action ends
//! with a `frame()` so the compositor applies it atomically.
//!
//! Button codes are Linux evdev codes (272 = BTN_LEFT and friends),
//! forwarded unchanged from capture.

use tracing::debug;
use wayland_client::protocol::wl_pointer;
use wayland_client::protocol::wl_seat::WlSeat;
use wayland_client::{Dispatch, QueueHandle};
use wayland_protocols_wlr::virtual_pointer::v1::client::{
    zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1,
    zwlr_virtual_pointer_v1::ZwlrVirtualPointerV1,
};

use crate::protocol::ScrollAxis;

/// Virtual pointer bound to a seat.
pub struct VirtualPointer {
    pointer: ZwlrVirtualPointerV1,
}

impl VirtualPointer {
    /// Create a virtual pointer on the given seat.
    pub fn new<State>(
        manager: &ZwlrVirtualPointerManagerV1,
        seat: &WlSeat,
        qh: &QueueHandle<State>,
    ) -> Self
    where
        State: Dispatch<ZwlrVirtualPointerV1, ()> + 'static,
    {
        let pointer = manager.create_virtual_pointer(Some(seat), qh, ());
        debug!("virtual pointer created");
        Self { pointer }
    }

    /// Relative motion followed by a frame.
    pub fn motion(&self, time: u32, dx: f64, dy: f64) {
        self.pointer.motion(time, dx, dy);
        self.pointer.frame();
    }

    /// Button press or release followed by a frame.
    pub fn button(&self, time: u32, button: u32, pressed: bool) {
        let state = if pressed {
            wl_pointer::ButtonState::Pressed
        } else {
            wl_pointer::ButtonState::Released
        };
        self.pointer.button(time, button, state);
        self.pointer.frame();
    }

    /// Scroll. A non-zero value becomes an axis event (with a discrete
    /// detent count when the source wheel reported one); a zero value ends
    /// the scroll sequence with an axis stop.
    pub fn scroll(&self, time: u32, axis: ScrollAxis, value: f64, steps: Option<i32>) {
        let axis = match axis {
            ScrollAxis::Vertical => wl_pointer::Axis::VerticalScroll,
            ScrollAxis::Horizontal => wl_pointer::Axis::HorizontalScroll,
        };

        if value == 0.0 {
            self.pointer.axis_stop(time, axis);
            self.pointer.frame();
            return;
        }

        self.pointer.axis_source(wl_pointer::AxisSource::Wheel);
        match steps {
            Some(steps) => self.pointer.axis_discrete(time, axis, value, steps),
            None => self.pointer.axis(time, axis, value),
        }
        self.pointer.frame();
    }
}

impl Drop for VirtualPointer {
    fn drop(&mut self) {
        debug!("virtual pointer destroyed");
        self.pointer.destroy();
    }
}
