pub mod instruction;

use bitvec::{bitarr, field::BitField, order::Msb0, slice::BitSlice, view::BitView, BitArr};
use smallvec::SmallVec;

use crate::driver::{InputMsg, RandomSource};
use crate::errors::Fault;
use instruction::{Instruction, Opcode};

//    Memory layout, low to high:
//      0x000..0x050   built-in font, one 5-byte glyph per hex digit
//      0x050..0x200   reserved for the interpreter, zeroed
//      0x200..0x1000  ROM image and its runtime data
//    Instruction words are big-endian: high byte at the lower address.

const RAM_SIZE: usize = 4096;
// Addresses are 12 bits wide; PC and every access through I wrap rather
// than walk off the end of RAM
const ADDR_MASK: u16 = (RAM_SIZE - 1) as u16;
const FONT_START: u16 = 0x000;
const ROM_START: u16 = 0x200;
const STACK_DEPTH: usize = 16;
const NUM_DATA_REGS: usize = 16;
const PC_STEP: u16 = 2;

/// Largest ROM image that fits between 0x200 and the end of RAM.
pub const MAX_ROM_SIZE: usize = RAM_SIZE - ROM_START as usize;

// Font data occupying memory reserved for the interpreter (<0x200);
// the glyph for hex digit `d` starts at FONT_START + d * 5
const FONT_SPRITES: [[u8; FONT_GLYPH_HEIGHT]; 16] = [
    [0xF0, 0x90, 0x90, 0x90, 0xF0], // 0
    [0x20, 0x60, 0x20, 0x20, 0x70], // 1
    [0xF0, 0x10, 0xF0, 0x80, 0xF0], // 2
    [0xF0, 0x10, 0xF0, 0x10, 0xF0], // 3
    [0x90, 0x90, 0xF0, 0x10, 0x10], // 4
    [0xF0, 0x80, 0xF0, 0x10, 0xF0], // 5
    [0xF0, 0x80, 0xF0, 0x90, 0xF0], // 6
    [0xF0, 0x10, 0x20, 0x40, 0x40], // 7
    [0xF0, 0x90, 0xF0, 0x90, 0xF0], // 8
    [0xF0, 0x90, 0xF0, 0x10, 0xF0], // 9
    [0xF0, 0x90, 0xF0, 0x90, 0x90], // A
    [0xE0, 0x90, 0xE0, 0x90, 0xE0], // B
    [0xF0, 0x80, 0x80, 0x80, 0xF0], // C
    [0xE0, 0x90, 0x90, 0x90, 0xE0], // D
    [0xF0, 0x80, 0xF0, 0x80, 0xF0], // E
    [0xF0, 0x80, 0xF0, 0x80, 0x80], // F
];
const FONT_GLYPH_HEIGHT: usize = 5;

pub const DISPLAY_WIDTH: usize = 64;
pub const DISPLAY_HEIGHT: usize = 32;
pub const NUM_KEYS: usize = 16;
pub const TIMER_FREQ: f32 = 60.0;

/// The CHIP-8 virtual machine: memory, registers, call stack, timers, the
/// key vector, and the frame buffer. Constructed once per ROM load and
/// mutated only by the interpreter thread; peripherals feed it through
/// [`receive_input`](Chip8::receive_input) and read it through the
/// `transmit_*` methods.
pub struct Chip8 {
    memory: [u8; RAM_SIZE],
    // Program counter; always masked to 12 bits
    pc: u16,
    // Call stack of return addresses. Emptiness and fullness are explicit
    // here; CALL past STACK_DEPTH frames and RET on empty are Faults.
    stack: SmallVec<[u16; STACK_DEPTH]>,
    // I - the address register. All 16 bits are kept (FX1E wraps mod
    // 65536); only the low 12 reach memory.
    i_reg: u16,
    // V - general purpose data registers; VF doubles as the carry /
    // borrow / collision flag
    v_reg: [u8; NUM_DATA_REGS],

    //  Output: 64x32-pixel monochrome display, row-major from the top-left
    //  corner, one bit per pixel
    display_bus: BitArr!(for DISPLAY_WIDTH * DISPLAY_HEIGHT),
    // Set by CLS/DRW, cleared when the frame is handed to the display
    redraw: bool,

    //  Input: 16-key keypad (0x0-0xF), bit n high while key n is held
    input_bus: BitArr!(for NUM_KEYS),

    // General timer used for game events
    delay_timer: u8,
    // Timer for sound effects; the beep line is high while nonzero
    sound_timer: u8,
}

impl Chip8 {
    pub fn new() -> Self {
        let mut sys = Chip8 {
            memory: [0; RAM_SIZE],
            pc: ROM_START,
            stack: SmallVec::new(),
            i_reg: 0,
            v_reg: [0; NUM_DATA_REGS],
            display_bus: bitarr![0; DISPLAY_WIDTH * DISPLAY_HEIGHT],
            redraw: false,
            input_bus: bitarr![0; NUM_KEYS],
            delay_timer: 0,
            sound_timer: 0,
        };

        sys.load_fonts();
        sys
    }

    fn load_fonts(&mut self) {
        for (i, byte) in FONT_SPRITES.iter().flatten().enumerate() {
            self.memory[(FONT_START as usize) + i] = *byte;
        }
    }

    /// Copy a ROM image to 0x200. The caller has already bounds-checked the
    /// image against [`MAX_ROM_SIZE`] (see `rom::read`).
    pub fn load_rom(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= MAX_ROM_SIZE);

        let start = ROM_START as usize;
        self.memory[start..start + data.len()].copy_from_slice(data);
    }

    fn read_mem(&self, addr: u16) -> u8 {
        self.memory[(addr & ADDR_MASK) as usize]
    }

    fn write_mem(&mut self, addr: u16, byte: u8) {
        self.memory[(addr & ADDR_MASK) as usize] = byte;
    }

    fn step_pc(&mut self) {
        self.pc = self.pc.wrapping_add(PC_STEP) & ADDR_MASK;
    }

    /// Read the big-endian instruction word at PC.
    pub fn fetch_opcode(&self) -> Opcode {
        let hb = self.read_mem(self.pc);
        let lb = self.read_mem(self.pc.wrapping_add(1));
        // The bitfield is constructed lsb -> msb
        Opcode::from_bytes([lb, hb])
    }

    /// Apply one instruction to the machine state. Pure state transform:
    /// all I/O stays with the peripherals, all failures come back as
    /// [`Fault`]s.
    pub fn exec_instruction(
        &mut self,
        instr: Instruction,
        rng: &mut dyn RandomSource,
    ) -> Result<(), Fault> {
        // Whether to step the PC at the end of the cycle; false when the
        // instruction set PC itself or must be retried (key wait)
        let mut advance = true;

        match instr {
            Instruction::Clear => {
                self.display_bus.fill(false);
                self.redraw = true;
            }
            Instruction::Ret => {
                let ret_addr = self.stack.pop().ok_or(Fault::StackUnderflow)?;
                self.pc = ret_addr & ADDR_MASK;
                advance = false;
            }
            Instruction::Jump(addr) => {
                self.pc = addr & ADDR_MASK;
                advance = false;
            }
            Instruction::Call(addr) => {
                if self.stack.len() == STACK_DEPTH {
                    return Err(Fault::StackOverflow(STACK_DEPTH));
                }
                self.stack.push(self.pc.wrapping_add(PC_STEP) & ADDR_MASK);
                self.pc = addr & ADDR_MASK;
                advance = false;
            }
            Instruction::SkipEqImm(x, nn) => {
                if self.v_reg[x as usize] == nn {
                    self.step_pc();
                }
            }
            Instruction::SkipNeImm(x, nn) => {
                if self.v_reg[x as usize] != nn {
                    self.step_pc();
                }
            }
            Instruction::SkipEqReg(x, y) => {
                if self.v_reg[x as usize] == self.v_reg[y as usize] {
                    self.step_pc();
                }
            }
            Instruction::LoadImm(x, nn) => {
                self.v_reg[x as usize] = nn;
            }
            Instruction::AddImm(x, nn) => {
                self.v_reg[x as usize] = self.v_reg[x as usize].wrapping_add(nn);
            }
            Instruction::Move(x, y) => {
                self.v_reg[x as usize] = self.v_reg[y as usize];
            }
            Instruction::Or(x, y) => {
                self.v_reg[x as usize] |= self.v_reg[y as usize];
            }
            Instruction::And(x, y) => {
                self.v_reg[x as usize] &= self.v_reg[y as usize];
            }
            Instruction::Xor(x, y) => {
                self.v_reg[x as usize] ^= self.v_reg[y as usize];
            }
            Instruction::Add(x, y) => {
                let (sum, carry) =
                    self.v_reg[x as usize].overflowing_add(self.v_reg[y as usize]);
                self.v_reg[0xF] = carry as u8;
                self.v_reg[x as usize] = sum;
            }
            Instruction::Sub(x, y) => {
                let (diff, borrow) =
                    self.v_reg[x as usize].overflowing_sub(self.v_reg[y as usize]);
                self.v_reg[0xF] = !borrow as u8;
                self.v_reg[x as usize] = diff;
            }
            Instruction::ShiftRight(x) => {
                let src = self.v_reg[x as usize];
                self.v_reg[0xF] = src & 0x1;
                self.v_reg[x as usize] = src >> 1;
            }
            Instruction::SubNeg(x, y) => {
                let (diff, borrow) =
                    self.v_reg[y as usize].overflowing_sub(self.v_reg[x as usize]);
                self.v_reg[0xF] = !borrow as u8;
                self.v_reg[x as usize] = diff;
            }
            Instruction::ShiftLeft(x) => {
                let src = self.v_reg[x as usize];
                self.v_reg[0xF] = src >> 7;
                self.v_reg[x as usize] = src << 1;
            }
            Instruction::SkipNeReg(x, y) => {
                if self.v_reg[x as usize] != self.v_reg[y as usize] {
                    self.step_pc();
                }
            }
            Instruction::LoadIndex(addr) => {
                self.i_reg = addr;
            }
            Instruction::JumpOffset(addr) => {
                self.pc = addr.wrapping_add(self.v_reg[0x0] as u16) & ADDR_MASK;
                advance = false;
            }
            Instruction::Random(x, nn) => {
                self.v_reg[x as usize] = rng.next_byte() & nn;
            }
            // Read an n-byte sprite from memory at I and XOR it onto the
            // display at (Vx, Vy). The start coordinate wraps; the sprite
            // body clips at the right and bottom edges. VF reports whether
            // any pixel flipped from on to off.
            Instruction::Draw(x, y, n) => {
                let x0 = self.v_reg[x as usize] as usize % DISPLAY_WIDTH;
                let y0 = self.v_reg[y as usize] as usize % DISPLAY_HEIGHT;
                self.v_reg[0xF] = 0;

                for row in 0..n as u16 {
                    let py = y0 + row as usize;
                    if py >= DISPLAY_HEIGHT {
                        break;
                    }
                    let byte = self.read_mem(self.i_reg.wrapping_add(row));
                    for (col, bit) in byte.view_bits::<Msb0>().iter().enumerate() {
                        let px = x0 + col;
                        if px >= DISPLAY_WIDTH {
                            break;
                        }
                        let idx = py * DISPLAY_WIDTH + px;
                        let lit = self.display_bus[idx];
                        self.v_reg[0xF] |= (lit & *bit) as u8;
                        self.display_bus.set(idx, lit ^ *bit);
                    }
                }

                self.redraw = true;
            }
            Instruction::SkipKeyDown(x) => {
                if self.key_down(self.v_reg[x as usize]) {
                    self.step_pc();
                }
            }
            Instruction::SkipKeyUp(x) => {
                if !self.key_down(self.v_reg[x as usize]) {
                    self.step_pc();
                }
            }
            Instruction::ReadDelay(x) => {
                self.v_reg[x as usize] = self.delay_timer;
            }
            Instruction::WaitKey(x) => {
                if let Some(key) = self.input_bus[..NUM_KEYS].iter().position(|down| *down) {
                    self.v_reg[x as usize] = key as u8;
                } else {
                    // No key held: leave PC in place and repeat the
                    // instruction next cycle. Timers keep running in the
                    // meantime since the tick loop never stops.
                    advance = false;
                }
            }
            Instruction::SetDelay(x) => {
                self.delay_timer = self.v_reg[x as usize];
            }
            Instruction::SetSound(x) => {
                self.sound_timer = self.v_reg[x as usize];
            }
            Instruction::AddIndex(x) => {
                self.i_reg = self.i_reg.wrapping_add(self.v_reg[x as usize] as u16);
            }
            Instruction::FontGlyph(x) => {
                let digit = (self.v_reg[x as usize] & 0xF) as u16;
                self.i_reg = FONT_START + digit * (FONT_GLYPH_HEIGHT as u16);
            }
            Instruction::StoreBcd(x) => {
                let vx = self.v_reg[x as usize];
                // Extracts the n-th decimal digit
                let d = |val, n| val / u8::pow(10, n) % 10;
                self.write_mem(self.i_reg, d(vx, 2));
                self.write_mem(self.i_reg.wrapping_add(1), d(vx, 1));
                self.write_mem(self.i_reg.wrapping_add(2), d(vx, 0));
            }
            Instruction::StoreRegs(x) => {
                for offset in 0..=(x as u16) {
                    self.write_mem(self.i_reg.wrapping_add(offset), self.v_reg[offset as usize]);
                }
            }
            Instruction::LoadRegs(x) => {
                for offset in 0..=(x as u16) {
                    self.v_reg[offset as usize] = self.read_mem(self.i_reg.wrapping_add(offset));
                }
            }
        }

        if advance {
            self.step_pc();
        }

        Ok(())
    }

    fn key_down(&self, key: u8) -> bool {
        self.input_bus[(key & 0xF) as usize]
    }

    /// Decrement both timers, saturating at zero. Called at the 60 Hz
    /// cadence regardless of the instruction rate.
    pub fn tick_timers(&mut self) {
        self.delay_timer = self.delay_timer.saturating_sub(1);
        self.sound_timer = self.sound_timer.saturating_sub(1);
    }

    // Rx 16-bit input key state
    pub fn receive_input(&mut self, msg: Option<InputMsg>) {
        if let Some(input) = msg {
            self.input_bus = input;
        }
    }

    // Tx 1-bit sound channel
    pub fn transmit_audio(&self) -> bool {
        self.sound_timer > 0
    }

    // Tx 2048 (64x32) bit display out
    pub fn transmit_frame(&self) -> &BitSlice<usize> {
        &self.display_bus.as_bitslice()[..DISPLAY_WIDTH * DISPLAY_HEIGHT]
    }

    /// Consume the dirty flag; true when the frame buffer changed since the
    /// last call.
    pub fn take_redraw(&mut self) -> bool {
        std::mem::take(&mut self.redraw)
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn index(&self) -> u16 {
        self.i_reg
    }

    pub fn data_regs(&self) -> &[u8; NUM_DATA_REGS] {
        &self.v_reg
    }

    pub fn stack_top(&self) -> Option<u16> {
        self.stack.last().copied()
    }

    pub fn delay(&self) -> u8 {
        self.delay_timer
    }

    /// The key vector as a 16-bit word, bit n high while key n is held.
    pub fn key_bits(&self) -> u16 {
        self.input_bus[..NUM_KEYS].load_le::<u16>()
    }
}
