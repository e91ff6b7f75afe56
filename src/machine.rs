//! Machine state and the cycle driver.

use tracing::{debug, error, trace};

use crate::core::font::{self, FONT_DATA};
use crate::core::opcode::{decode, Instruction};
use crate::core::registers::{Registers, FLAG_REGISTER};
use crate::core::stack::Stack;
use crate::core::types::{C8Addr, C8Byte, C8RegIdx};
use crate::error::{CoreError, CoreResult};
use crate::peripherals::keypad::Keypad;
use crate::peripherals::screen::Screen;
use crate::quirks::Quirks;

/// Total addressable RAM, in bytes.
pub const RAM_SIZE: usize = 4096;

/// RAM offset the program image is loaded at and execution begins from.
pub const PROGRAM_START: C8Addr = 0x200;

/// Maximum ROM size accepted by [`Machine::load_rom`].
pub const PROGRAM_CAPACITY: usize = RAM_SIZE - PROGRAM_START as usize;

/// Pending `Fx0A` key-wait: which register the next key-down edge resolves
/// into.
#[derive(Debug, Clone, Copy, Default)]
struct WaitState {
    awaiting: bool,
    target_register: C8RegIdx,
}

/// The CHIP-8 machine: RAM, registers, both peripherals, and the random
/// oracle, all owned by a single aggregate.
pub struct Machine {
    ram: [C8Byte; RAM_SIZE],
    registers: Registers,
    pc: C8Addr,
    stack: Stack,
    delay_timer: C8Byte,
    sound_timer: C8Byte,
    screen: Screen,
    keypad: Keypad,
    wait: WaitState,
    quirks: Quirks,
    random: Box<dyn FnMut(C8Byte) -> C8Byte>,
}

impl Machine {
    /// Create a machine with an explicit quirk configuration and random
    /// oracle. The standard font is loaded at RAM offset 0 immediately.
    ///
    /// # Arguments
    ///
    /// * `quirks` - Hardware-variant configuration.
    /// * `random` - Random oracle: given an opaque seed byte, returns an
    ///   8-bit value. Tests typically inject a closure returning a fixed or
    ///   table-driven sequence.
    pub fn new(quirks: Quirks, random: impl FnMut(C8Byte) -> C8Byte + 'static) -> Self {
        let mut machine = Machine {
            ram: [0; RAM_SIZE],
            registers: Registers::new(),
            pc: PROGRAM_START,
            stack: Stack::new(),
            delay_timer: 0,
            sound_timer: 0,
            screen: Screen::new(),
            keypad: Keypad::new(),
            wait: WaitState::default(),
            quirks,
            random: Box::new(random),
        };
        machine.load_font(&FONT_DATA);
        machine
    }

    /// Create a machine with the given quirks and a production random
    /// oracle backed by [`rand`].
    ///
    /// # Arguments
    ///
    /// * `quirks` - Hardware-variant configuration.
    pub fn with_default_rng(quirks: Quirks) -> Self {
        Machine::new(quirks, |_seed| rand::random::<C8Byte>())
    }

    /// Copy font glyph data into RAM starting at offset 0.
    ///
    /// # Arguments
    ///
    /// * `bytes` - 80 bytes of glyph data, 16 glyphs of 5 bytes each.
    pub fn load_font(&mut self, bytes: &[C8Byte; 80]) {
        self.ram[0..80].copy_from_slice(bytes);
    }

    /// Copy a program image into RAM starting at 0x200.
    ///
    /// # Arguments
    ///
    /// * `bytes` - Raw program bytes, no header.
    pub fn load_rom(&mut self, bytes: &[C8Byte]) -> CoreResult<()> {
        if bytes.len() > PROGRAM_CAPACITY {
            return Err(CoreError::RomTooLarge {
                size: bytes.len(),
                capacity: PROGRAM_CAPACITY,
            });
        }

        let start = PROGRAM_START as usize;
        self.ram[start..start + bytes.len()].copy_from_slice(bytes);
        debug!(size = bytes.len(), "ROM loaded");
        Ok(())
    }

    /// Reset the program counter to 0x200. RAM, registers, and peripherals
    /// are left as-is; callers typically load font and ROM before the
    /// first reset.
    pub fn reset(&mut self) {
        self.pc = PROGRAM_START;
        debug!("machine reset");
    }

    /// Current frame buffer rows. Bit 63 of each row is the leftmost pixel.
    pub fn frame_buffer(&self) -> &[u64; 32] {
        self.screen.rows()
    }

    /// Read and clear the dirty flag in one step.
    pub fn take_dirty(&mut self) -> bool {
        self.screen.take_dirty()
    }

    /// Current delay timer value.
    pub fn delay_timer(&self) -> C8Byte {
        self.delay_timer
    }

    /// Current sound timer value.
    pub fn sound_timer(&self) -> C8Byte {
        self.sound_timer
    }

    /// Current program counter.
    pub fn pc(&self) -> C8Addr {
        self.pc
    }

    /// `true` while the machine is waiting for a key-down edge (`Fx0A`).
    pub fn is_waiting_for_key(&self) -> bool {
        self.wait.awaiting
    }

    /// Register a key-down edge. Updates the keypad latch and, if a
    /// `Fx0A` wait is pending, resolves it by storing the key nibble into
    /// the target register and resuming normal cycling.
    ///
    /// # Arguments
    ///
    /// * `key` - Key nibble, 0x0..0xF.
    pub fn handle_key_down(&mut self, key: C8Byte) {
        self.keypad.press(key);

        if self.wait.awaiting {
            self.registers.set(self.wait.target_register, key & 0xF);
            self.wait.awaiting = false;
            debug!(key, "key-wait resolved");
        }
    }

    /// Register a key-up edge. Updates the keypad latch only.
    ///
    /// # Arguments
    ///
    /// * `key` - Key nibble, 0x0..0xF.
    pub fn handle_key_up(&mut self, key: C8Byte) {
        self.keypad.release(key);
    }

    /// Run one cycle: a timer tick plus one fetch+execute, or a no-op while
    /// waiting for a key.
    pub fn cycle(&mut self) -> CoreResult<()> {
        if self.wait.awaiting {
            return Ok(());
        }

        if self.delay_timer > 0 {
            self.delay_timer -= 1;
        }
        if self.sound_timer > 0 {
            self.sound_timer -= 1;
        }

        let fetch_pc = self.pc;
        let ins = self.fetch();

        let instruction = decode(ins).ok_or_else(|| {
            error!(opcode = ins, pc = fetch_pc, "unknown opcode");
            CoreError::UnknownOpcode {
                opcode: ins,
                pc: fetch_pc,
            }
        })?;

        trace!(opcode = ins, pc = fetch_pc, ?instruction, "executing");
        self.execute(instruction, fetch_pc)
    }

    /// Read the instruction word at `pc`/`pc+1` and advance `pc` by 2.
    fn fetch(&mut self) -> C8Addr {
        let hi = self.ram[self.pc as usize % RAM_SIZE];
        let lo = self.ram[(self.pc as usize + 1) % RAM_SIZE];
        self.pc = self.pc.wrapping_add(2) % RAM_SIZE as C8Addr;

        (C8Addr::from(hi) << 8) | C8Addr::from(lo)
    }

    /// Skip the next 2-byte instruction: used by conditional-skip opcodes
    /// whose predicate held.
    fn skip(&mut self) {
        self.pc = self.pc.wrapping_add(2) % RAM_SIZE as C8Addr;
    }

    fn ram_slice(&self, offset: C8Addr, len: usize) -> CoreResult<&[C8Byte]> {
        let start = offset as usize;
        let end = start + len;
        if end > RAM_SIZE {
            return Err(CoreError::memory_out_of_range(offset, len, RAM_SIZE));
        }
        Ok(&self.ram[start..end])
    }

    fn ram_slice_mut(&mut self, offset: C8Addr, len: usize) -> CoreResult<&mut [C8Byte]> {
        let start = offset as usize;
        let end = start + len;
        if end > RAM_SIZE {
            return Err(CoreError::memory_out_of_range(offset, len, RAM_SIZE));
        }
        Ok(&mut self.ram[start..end])
    }

    /// Dispatch one decoded instruction.
    ///
    /// # Arguments
    ///
    /// * `instruction` - Decoded instruction.
    /// * `fetch_pc` - Program counter the instruction was fetched from;
    ///   carried only for diagnostics on stack errors.
    fn execute(&mut self, instruction: Instruction, fetch_pc: C8Addr) -> CoreResult<()> {
        match instruction {
            Instruction::Sys(addr) => {
                return Err(CoreError::UnimplementedSys {
                    opcode: addr,
                    pc: fetch_pc,
                });
            }
            Instruction::Cls => self.screen.clear(),
            Instruction::Ret => {
                self.pc = self.stack.pop(fetch_pc)?;
            }
            Instruction::Jp(addr) => self.pc = addr,
            Instruction::Call(addr) => {
                self.stack.push(self.pc, fetch_pc)?;
                self.pc = addr;
            }
            Instruction::SeByte(x, nn) => {
                if self.registers.get(x) == nn {
                    self.skip();
                }
            }
            Instruction::SneByte(x, nn) => {
                if self.registers.get(x) != nn {
                    self.skip();
                }
            }
            Instruction::Se(x, y) => {
                if self.registers.get(x) == self.registers.get(y) {
                    self.skip();
                }
            }
            Instruction::Sne(x, y) => {
                if self.registers.get(x) != self.registers.get(y) {
                    self.skip();
                }
            }
            Instruction::LdByte(x, nn) => self.registers.set(x, nn),
            Instruction::AddByte(x, nn) => {
                let vx = self.registers.get(x);
                self.registers.set(x, vx.wrapping_add(nn));
            }
            Instruction::Ld(x, y) => {
                let vy = self.registers.get(y);
                self.registers.set(x, vy);
            }
            Instruction::Or(x, y) => {
                let result = self.registers.get(x) | self.registers.get(y);
                self.registers.set(x, result);
            }
            Instruction::And(x, y) => {
                let result = self.registers.get(x) & self.registers.get(y);
                self.registers.set(x, result);
            }
            Instruction::Xor(x, y) => {
                let result = self.registers.get(x) ^ self.registers.get(y);
                self.registers.set(x, result);
            }
            Instruction::Add(x, y) => {
                let (vx, vy) = (self.registers.get(x), self.registers.get(y));
                let (result, carry) = vx.overflowing_add(vy);
                self.registers.set_with_flag(x, result, carry as C8Byte);
            }
            Instruction::Sub(x, y) => {
                let (vx, vy) = (self.registers.get(x), self.registers.get(y));
                let flag = (vx >= vy) as C8Byte;
                self.registers.set_with_flag(x, vx.wrapping_sub(vy), flag);
            }
            Instruction::Subn(x, y) => {
                let (vx, vy) = (self.registers.get(x), self.registers.get(y));
                let flag = (vy >= vx) as C8Byte;
                self.registers.set_with_flag(x, vy.wrapping_sub(vx), flag);
            }
            Instruction::Shr(x, y) => {
                let operand = if self.quirks.shift_uses_vy {
                    self.registers.get(y)
                } else {
                    self.registers.get(x)
                };
                let flag = operand & 1;
                self.registers.set_with_flag(x, operand >> 1, flag);
            }
            Instruction::Shl(x, y) => {
                let operand = if self.quirks.shift_uses_vy {
                    self.registers.get(y)
                } else {
                    self.registers.get(x)
                };
                let flag = (operand >> 7) & 1;
                self.registers
                    .set_with_flag(x, operand.wrapping_shl(1), flag);
            }
            Instruction::LdI(addr) => self.registers.set_i(addr),
            Instruction::Jp0(addr) => {
                let v0 = C8Addr::from(self.registers.get(0));
                self.pc = addr.wrapping_add(v0) & 0x0FFF;
            }
            Instruction::Rnd(x, nn) => {
                let sample = (self.random)(nn);
                self.registers.set(x, sample & nn);
            }
            Instruction::Drw(x, y, n) => {
                let i = self.registers.i();
                let sprite = self.ram_slice(i, n as usize)?.to_vec();
                let (vx, vy) = (self.registers.get(x), self.registers.get(y));
                let collision = self.screen.draw_sprite(vx, vy, &sprite);
                self.registers.set(FLAG_REGISTER, collision as C8Byte);
            }
            Instruction::Skp(x) => {
                let key = self.registers.get(x) & 0xF;
                if self.keypad.is_down(key) {
                    self.skip();
                }
            }
            Instruction::Sknp(x) => {
                let key = self.registers.get(x) & 0xF;
                if !self.keypad.is_down(key) {
                    self.skip();
                }
            }
            Instruction::LdGetDelayTimer(x) => self.registers.set(x, self.delay_timer),
            Instruction::LdGetKey(x) => {
                self.wait = WaitState {
                    awaiting: true,
                    target_register: x,
                };
                debug!(target_register = x, "entering key-wait");
            }
            Instruction::LdSetDelayTimer(x) => self.delay_timer = self.registers.get(x),
            Instruction::LdSetSoundTimer(x) => self.sound_timer = self.registers.get(x),
            Instruction::AddI(x) => {
                let vx = C8Addr::from(self.registers.get(x));
                let i = self.registers.i();
                self.registers.set_i(i.wrapping_add(vx));
            }
            Instruction::LdSprite(x) => {
                let digit = self.registers.get(x) & 0x0F;
                self.registers.set_i(font::glyph_address(digit));
            }
            Instruction::LdBcd(x) => {
                let value = self.registers.get(x);
                let i = self.registers.i();
                let bcd = [value / 100, (value / 10) % 10, value % 10];
                self.ram_slice_mut(i, 3)?.copy_from_slice(&bcd);
            }
            Instruction::LdStore(x) => {
                let i = self.registers.i();
                let count = x as usize + 1;
                let values: Vec<C8Byte> = (0..count)
                    .map(|idx| self.registers.get(idx as C8RegIdx))
                    .collect();
                let dest = self.ram_slice_mut(i, count)?;
                dest.copy_from_slice(&values);
            }
            Instruction::LdLoad(x) => {
                let i = self.registers.i();
                let count = x as usize + 1;
                let src = self.ram_slice(i, count)?.to_vec();
                for (idx, byte) in src.into_iter().enumerate() {
                    self.registers.set(idx as C8RegIdx, byte);
                }
            }
        }

        Ok(())
    }
}

impl Default for Machine {
    fn default() -> Self {
        Machine::with_default_rng(Quirks::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_with_rom(rom: &[u8]) -> Machine {
        let mut machine = Machine::with_default_rng(Quirks::default());
        machine.load_rom(rom).unwrap();
        machine
    }

    #[test]
    fn jump_and_halt_loop() {
        let mut machine = machine_with_rom(&[0x12, 0x00]);
        machine.cycle().unwrap();
        assert_eq!(machine.pc(), 0x200);
    }

    #[test]
    fn set_add_skip() {
        let mut machine = machine_with_rom(&[0x60, 0x05, 0x70, 0x03, 0x30, 0x08, 0x12, 0x00]);
        machine.cycle().unwrap();
        machine.cycle().unwrap();
        machine.cycle().unwrap();
        assert_eq!(machine.pc(), 0x208);
        assert_eq!(machine_reg(&machine, 0), 0x08);
    }

    #[test]
    fn call_and_return() {
        // 0x200: CALL 0x206; 0x202: JP 0x204; 0x204: unreached filler;
        // 0x206: RET.
        let mut machine =
            machine_with_rom(&[0x22, 0x06, 0x12, 0x04, 0x00, 0x00, 0x00, 0xEE]);
        machine.cycle().unwrap();
        assert_eq!(machine.pc(), 0x206);
        machine.cycle().unwrap();
        assert_eq!(machine.pc(), 0x202);
        machine.cycle().unwrap();
        assert_eq!(machine.pc(), 0x204);
    }

    #[test]
    fn sprite_draw_with_collision() {
        let mut machine = Machine::with_default_rng(Quirks::default());
        machine.load_rom(&[0xD0, 0x15]).unwrap();
        // I defaults to 0, which already holds the glyph-0 font data.
        machine.cycle().unwrap();
        assert_eq!(machine_reg(&machine, 0xF), 0);
        assert_ne!(machine.frame_buffer()[0], 0);

        machine.reset();
        machine.cycle().unwrap();
        assert_eq!(machine_reg(&machine, 0xF), 1);
        assert_eq!(machine.frame_buffer()[0], 0);
    }

    #[test]
    fn bcd_of_156() {
        let mut machine = machine_with_rom(&[0xF2, 0x33]);
        set_reg(&mut machine, 2, 0x9C);
        set_i(&mut machine, 0x300);
        machine.cycle().unwrap();
        assert_eq!(ram_byte(&machine, 0x300), 1);
        assert_eq!(ram_byte(&machine, 0x301), 5);
        assert_eq!(ram_byte(&machine, 0x302), 6);
    }

    #[test]
    fn wait_for_key_then_resume() {
        let mut machine = machine_with_rom(&[0xF3, 0x0A, 0x12, 0x00]);
        machine.cycle().unwrap();
        assert_eq!(machine.pc(), 0x202);
        assert!(machine.is_waiting_for_key());

        machine.cycle().unwrap();
        assert_eq!(machine.pc(), 0x202, "cycle is a no-op while waiting");

        machine.handle_key_down(0xA);
        assert!(!machine.is_waiting_for_key());
        assert_eq!(machine_reg(&machine, 3), 0xA);

        machine.cycle().unwrap();
        assert_eq!(machine.pc(), 0x200);
    }

    #[test]
    fn sys_is_a_fatal_unimplemented_error() {
        let mut machine = machine_with_rom(&[0x01, 0x23]);
        let err = machine.cycle().unwrap_err();
        assert_eq!(
            err,
            CoreError::UnimplementedSys {
                opcode: 0x123,
                pc: 0x200
            }
        );
    }

    #[test]
    fn ret_on_empty_stack_is_fatal() {
        let mut machine = machine_with_rom(&[0x00, 0xEE]);
        assert_eq!(
            machine.cycle().unwrap_err(),
            CoreError::StackUnderflow { pc: 0x200 }
        );
    }

    #[test]
    fn drw_reading_past_ram_is_memory_out_of_range() {
        let mut machine = machine_with_rom(&[0xD0, 0x1F]);
        set_i(&mut machine, 4090);
        assert!(matches!(
            machine.cycle().unwrap_err(),
            CoreError::MemoryOutOfRange { .. }
        ));
    }

    #[test]
    fn add_with_x_equal_to_vf_keeps_flag_not_sum() {
        let mut machine = machine_with_rom(&[0x8F, 0x14]);
        set_reg(&mut machine, 0xF, 0xFF);
        set_reg(&mut machine, 1, 0x01);
        machine.cycle().unwrap();
        assert_eq!(machine_reg(&machine, 0xF), 1);
    }

    #[test]
    fn shr_quirk_toggle_sources_from_vy() {
        let random = |_seed: u8| 0u8;
        let mut machine = Machine::new(
            Quirks {
                shift_uses_vy: true,
            },
            random,
        );
        machine.load_rom(&[0x81, 0x06]).unwrap();
        set_reg(&mut machine, 1, 0xFF);
        set_reg(&mut machine, 0, 0b0000_0011);
        machine.cycle().unwrap();
        assert_eq!(machine_reg(&machine, 1), 0b0000_0001);
        assert_eq!(machine_reg(&machine, 0xF), 1);
    }

    fn machine_reg(machine: &Machine, idx: u8) -> u8 {
        machine.registers.get(idx)
    }

    fn set_reg(machine: &mut Machine, idx: u8, value: u8) {
        machine.registers.set(idx, value);
    }

    fn set_i(machine: &mut Machine, value: u16) {
        machine.registers.set_i(value);
    }

    fn ram_byte(machine: &Machine, addr: u16) -> u8 {
        machine.ram[addr as usize]
    }
}
