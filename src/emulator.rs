use std::cell::RefCell;
use std::path::Path;
use std::time::Duration;

use log::info;

use crate::chip8::instruction::Instruction;
use crate::chip8::{Chip8, TIMER_FREQ};
use crate::driver::host::{Entropy, MonotonicClock};
use crate::driver::{AudioDevice, Clock, DisplayDevice, InputDevice, RandomSource};
use crate::errors::{Fault, RomError};
use crate::rom;

pub const DEFAULT_CLOCK_FREQ: f32 = 600.0;

/// Out-of-band events raised by peripherals during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    None,
    NewInputs,
    ProgramExit,
}

/// Machine snapshot handed to the display sink when the diagnostic panel is
/// enabled. `pc` is the address of the *next* fetch; `opcode`/`instr` are
/// the instruction that just ran.
pub struct Diagnostics {
    pub ticks: u64,
    pub opcode: u16,
    pub instr: Instruction,
    pub pc: u16,
    pub i_reg: u16,
    pub v: [u8; 3],
    pub stack_top: Option<u16>,
    pub keys: u16,
}

/// The tick driver. Owns the machine, borrows the peripherals for its
/// lifetime, and paces the fetch/decode/execute loop against the clock.
pub struct Emulator<'i, 'd, 'a> {
    // The system we're emulating -- CHIP-8
    system: Chip8,

    input_device: &'i RefCell<dyn InputDevice>,
    display: &'d RefCell<dyn DisplayDevice>,
    speaker: &'a RefCell<dyn AudioDevice>,
    clock: Box<dyn Clock>,
    rng: Box<dyn RandomSource>,

    clock_hz: f32,
    // Instructions per timer decrement; keeps the 60 Hz timers decoupled
    // from the instruction rate
    timer_divisor: u32,
    cycles: u32,
    ticks: u64,
    diagnostics: bool,
}

impl<'i, 'd, 'a> Emulator<'i, 'd, 'a> {
    pub fn with_peripherals(
        input: &'i RefCell<dyn InputDevice>,
        display: &'d RefCell<dyn DisplayDevice>,
        audio: &'a RefCell<dyn AudioDevice>,
    ) -> Emulator<'i, 'd, 'a> {
        Emulator {
            system: Chip8::new(),
            input_device: input,
            display,
            speaker: audio,
            clock: Box::new(MonotonicClock),
            rng: Box::new(Entropy::new()),
            clock_hz: DEFAULT_CLOCK_FREQ,
            timer_divisor: divisor(DEFAULT_CLOCK_FREQ),
            cycles: 0,
            ticks: 0,
            diagnostics: false,
        }
    }

    /// Set the instruction rate (Hz). The timer cadence stays at 60 Hz.
    pub fn set_clock_speed(&mut self, hz: f32) {
        self.clock_hz = hz;
        self.timer_divisor = divisor(hz);
    }

    /// Feed `Diagnostics` snapshots to the display sink at the timer
    /// cadence.
    pub fn set_diagnostics(&mut self, enabled: bool) {
        self.diagnostics = enabled;
    }

    pub fn set_clock(&mut self, clock: Box<dyn Clock>) {
        self.clock = clock;
    }

    pub fn set_random_source(&mut self, rng: Box<dyn RandomSource>) {
        self.rng = rng;
    }

    pub fn load_program<P: AsRef<Path>>(&mut self, path: P) -> Result<(), RomError> {
        let image = rom::read(&path)?;
        info!(
            "loaded {} byte ROM from {}",
            image.len(),
            path.as_ref().display()
        );
        self.system.load_rom(&image);
        Ok(())
    }

    /// One tick: poll input, run one instruction, advance the timers at
    /// their cadence, and present if the machine redrew.
    pub fn step(&mut self) -> Result<Signal, Fault> {
        // Input first so the key skips and the key wait see the freshest
        // state this tick
        let signal = self.input_device.borrow_mut().handle_inputs();
        match signal {
            Signal::ProgramExit => return Ok(Signal::ProgramExit),
            Signal::NewInputs => {
                self.system
                    .receive_input(self.input_device.borrow().send_inputs());
            }
            Signal::None => {}
        }

        let opcode = u16::from(self.system.fetch_opcode());
        let instr = Instruction::decode(opcode)?;
        self.system.exec_instruction(instr, self.rng.as_mut())?;
        self.ticks += 1;

        self.cycles += 1;
        let timer_edge = self.cycles >= self.timer_divisor;
        if timer_edge {
            self.cycles = 0;
            self.system.tick_timers();
        }

        let redraw = self.system.take_redraw();
        if redraw || (timer_edge && self.diagnostics) {
            let mut display = self.display.borrow_mut();
            if redraw {
                display.receive_frame(self.system.transmit_frame());
            }
            if self.diagnostics {
                display.receive_diagnostics(&self.report(opcode, instr));
            }
            display.drive_display();
        }
        self.speaker
            .borrow_mut()
            .receive_signal(self.system.transmit_audio());

        Ok(Signal::None)
    }

    /// Run until the input source requests shutdown or the machine faults.
    pub fn run(&mut self) -> Result<(), Fault> {
        let period = Duration::from_secs_f32(1.0 / self.clock_hz);
        let mut deadline = self.clock.now();

        loop {
            if let Signal::ProgramExit = self.step()? {
                break;
            }

            deadline += period;
            // A stall (terminal resize, host hiccup) re-anchors the cadence
            // instead of accumulating debt
            let now = self.clock.now();
            if deadline < now {
                deadline = now;
            }
            self.clock.sleep_until(deadline);
        }

        // Final present so the last frame is not lost on teardown
        let mut display = self.display.borrow_mut();
        display.receive_frame(self.system.transmit_frame());
        display.drive_display();

        Ok(())
    }

    fn report(&self, opcode: u16, instr: Instruction) -> Diagnostics {
        let v = self.system.data_regs();
        Diagnostics {
            ticks: self.ticks,
            opcode,
            instr,
            pc: self.system.pc(),
            i_reg: self.system.index(),
            v: [v[0x0], v[0x1], v[0x2]],
            stack_top: self.system.stack_top(),
            keys: self.system.key_bits(),
        }
    }
}

fn divisor(clock_hz: f32) -> u32 {
    ((clock_hz / TIMER_FREQ).round() as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{InputMsg, NullDevice};
    use std::time::Instant;

    // Scripted keypad: whatever the test pressed last, reported once as
    // fresh input
    struct ScriptedKeys {
        msg: InputMsg,
        fresh: bool,
        exit: bool,
    }

    impl Default for ScriptedKeys {
        fn default() -> Self {
            ScriptedKeys {
                msg: InputMsg::ZERO,
                fresh: false,
                exit: false,
            }
        }
    }

    impl ScriptedKeys {
        fn press(&mut self, key: usize) {
            self.msg.set(key, true);
            self.fresh = true;
        }
    }

    impl InputDevice for ScriptedKeys {
        fn handle_inputs(&mut self) -> Signal {
            if self.exit {
                Signal::ProgramExit
            } else if self.fresh {
                self.fresh = false;
                Signal::NewInputs
            } else {
                Signal::None
            }
        }

        fn send_inputs(&self) -> Option<InputMsg> {
            Some(self.msg)
        }
    }

    struct InstantClock;

    impl Clock for InstantClock {
        fn now(&self) -> Instant {
            Instant::now()
        }

        fn sleep_until(&self, _deadline: Instant) {}
    }

    struct FixedRng(u8);

    impl RandomSource for FixedRng {
        fn next_byte(&mut self) -> u8 {
            self.0
        }
    }

    struct CountingDisplay {
        frames: usize,
        reports: usize,
    }

    impl CountingDisplay {
        fn new() -> Self {
            CountingDisplay { frames: 0, reports: 0 }
        }
    }

    impl DisplayDevice for CountingDisplay {
        fn receive_frame(&mut self, _frame: &bitvec::slice::BitSlice<usize>) {
            self.frames += 1;
        }

        fn receive_diagnostics(&mut self, _report: &Diagnostics) {
            self.reports += 1;
        }

        fn drive_display(&mut self) {}
    }

    #[test]
    fn key_wait_holds_the_machine_but_not_the_timers() {
        let input = RefCell::new(ScriptedKeys::default());
        let display = RefCell::new(NullDevice::Display);
        let audio = RefCell::new(NullDevice::Audio);
        let mut emu = Emulator::with_peripherals(&input, &display, &audio);
        // LD VA, 60; LD DT, VA; LD V3, K
        emu.system.load_rom(&[0x6A, 0x3C, 0xFA, 0x15, 0xF3, 0x0A]);

        for _ in 0..2 {
            emu.step().unwrap();
        }
        assert_eq!(emu.system.delay(), 60);

        // 100 ticks with no key held: parked on the wait, but the 60 Hz
        // cadence (every 10th instruction at the default rate) marches on
        for _ in 0..100 {
            assert_eq!(emu.step().unwrap(), Signal::None);
            assert_eq!(emu.system.pc(), 0x204);
        }
        assert_eq!(emu.system.delay(), 60 - 10);

        input.borrow_mut().press(0x7);
        emu.step().unwrap();
        assert_eq!(emu.system.data_regs()[0x3], 0x07);
        assert_eq!(emu.system.pc(), 0x206);
    }

    #[test]
    fn run_stops_on_program_exit() {
        let input = RefCell::new(ScriptedKeys {
            exit: true,
            ..Default::default()
        });
        let display = RefCell::new(CountingDisplay::new());
        let audio = RefCell::new(NullDevice::Audio);
        let mut emu = Emulator::with_peripherals(&input, &display, &audio);
        emu.set_clock(Box::new(InstantClock));

        emu.run().unwrap();
        // The farewell present still happens
        assert_eq!(display.borrow().frames, 1);
    }

    #[test]
    fn run_halts_on_fault() {
        let input = RefCell::new(ScriptedKeys::default());
        let display = RefCell::new(NullDevice::Display);
        let audio = RefCell::new(NullDevice::Audio);
        let mut emu = Emulator::with_peripherals(&input, &display, &audio);
        emu.set_clock(Box::new(InstantClock));
        // Memory is zeroed and 0x0000 is not an instruction

        assert_eq!(emu.run(), Err(Fault::UnknownOpcode(0x0000)));
    }

    #[test]
    fn injected_random_source_feeds_rnd() {
        let input = RefCell::new(ScriptedKeys::default());
        let display = RefCell::new(NullDevice::Display);
        let audio = RefCell::new(NullDevice::Audio);
        let mut emu = Emulator::with_peripherals(&input, &display, &audio);
        emu.set_random_source(Box::new(FixedRng(0xFF)));
        emu.system.load_rom(&[0xC0, 0x0F]);

        emu.step().unwrap();
        assert_eq!(emu.system.data_regs()[0x0], 0x0F);
    }

    #[test]
    fn presents_only_when_the_machine_redraws() {
        let input = RefCell::new(ScriptedKeys::default());
        let display = RefCell::new(CountingDisplay::new());
        let audio = RefCell::new(NullDevice::Audio);
        let mut emu = Emulator::with_peripherals(&input, &display, &audio);
        // CLS; LD V0, 0; CLS
        emu.system
            .load_rom(&[0x00, 0xE0, 0x60, 0x00, 0x00, 0xE0]);

        emu.step().unwrap();
        assert_eq!(display.borrow().frames, 1);

        // LD does not touch the frame buffer: no present
        emu.step().unwrap();
        assert_eq!(display.borrow().frames, 1);

        emu.step().unwrap();
        assert_eq!(display.borrow().frames, 2);
    }

    #[test]
    fn diagnostics_reports_follow_the_timer_cadence() {
        let input = RefCell::new(ScriptedKeys::default());
        let display = RefCell::new(CountingDisplay::new());
        let audio = RefCell::new(NullDevice::Audio);
        let mut emu = Emulator::with_peripherals(&input, &display, &audio);
        emu.set_diagnostics(true);
        // A two-instruction loop that never draws: JP 0x202; JP 0x200
        emu.system.load_rom(&[0x12, 0x02, 0x12, 0x00]);

        // Default divisor is 600 / 60 = 10 instructions per report
        for _ in 0..30 {
            emu.step().unwrap();
        }
        assert_eq!(display.borrow().reports, 3);
        assert_eq!(display.borrow().frames, 0);
    }
}
