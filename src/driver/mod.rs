pub mod host;
pub mod termion;

use std::time::Instant;

use bitvec::{slice::BitSlice, BitArr};

use crate::chip8::NUM_KEYS;
use crate::emulator::{Diagnostics, Signal};

// A 16-bit CHIP-8 input message representing the incoming, updated key states
// where the nth bit corresponds to the (n as hex) key status
//
//   Example: 0b1000_0001_0000_1101
//         => keys 0, 2, 3, 8, and F are in the down state
//            and all other keys in the up state
//
pub type InputMsg = BitArr!(for NUM_KEYS);

pub const KEY_UP: bool = false;
pub const KEY_DOWN: bool = true;

pub const PX_OFF: bool = false;
pub const PX_ON: bool = true;

// Model input device (e.g. keypad, keyboard, touchscreen, etc.) interfacing
// with our CHIP-8 system. `handle_inputs` drains whatever event source feeds
// the device and reports shutdown requests; `send_inputs` is the key-state
// snapshot the machine polls every tick.
pub trait InputDevice {
    fn handle_inputs(&mut self) -> Signal;

    fn send_inputs(&self) -> Option<InputMsg>;
}

// Model display device (e.g. terminal screen, UI library window, etc.)
// interfacing with our CHIP-8 system. Frames and diagnostic reports are
// buffered by `receive_*` and presented by `drive_display`.
pub trait DisplayDevice {
    fn receive_frame(&mut self, frame: &BitSlice<usize>);

    fn receive_diagnostics(&mut self, _report: &Diagnostics) {}

    fn drive_display(&mut self);
}

// Model audio device (e.g. audio drivers, beeper, etc.) interfacing with our
// CHIP-8 system. The machine exposes a single boolean beep line.
pub trait AudioDevice {
    fn receive_signal(&mut self, active: bool);
}

// Monotonic time source pacing the interpreter.
pub trait Clock {
    fn now(&self) -> Instant;

    fn sleep_until(&self, deadline: Instant);
}

// Uniformly distributed bytes for the RND instruction.
pub trait RandomSource {
    fn next_byte(&mut self) -> u8;
}

// Model empty device -- puts `/dev/null` into perspective. The machine runs
// fine with no peripherals hooked up to it.
#[derive(Clone, Copy)]
pub enum NullDevice {
    Input,
    Display,
    Audio,
}

impl InputDevice for NullDevice {
    fn handle_inputs(&mut self) -> Signal {
        Signal::None
    }

    fn send_inputs(&self) -> Option<InputMsg> {
        None
    }
}

impl DisplayDevice for NullDevice {
    fn receive_frame(&mut self, _frame: &BitSlice<usize>) {}

    fn drive_display(&mut self) {}
}

impl AudioDevice for NullDevice {
    fn receive_signal(&mut self, _active: bool) {}
}
