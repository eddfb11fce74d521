//! x86_64 trap frame and FPU state
//!
//! The trap frame holds the full register file saved on every kernel
//! entry. The layout matches the push order in `entry.rs` assembly;
//! DO NOT reorder fields without updating the stubs.
//!
//! Frame layout, low address first (top of stack after the pushes):
//! r15..rax pushed by the stub, then vector / error code, then the
//! hardware-pushed `rip cs rflags rsp ss` tail.

use core::fmt;

/// How the kernel was entered; selects the matching exit path.
pub const ENTRY_INTERRUPT: u64 = 0;
pub const ENTRY_SYSCALL_TRAP: u64 = 1;
pub const ENTRY_SYSCALL_FAST: u64 = 2;

/// Byte length of the `int` instruction, used to rewind the program
/// counter when a blocked syscall must repeat.
pub const SYSCALL_INSN_LEN: u64 = 2;

/// CPU context saved on kernel entry.
///
/// Field order mirrors the save sequence in `entry.rs`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    // Pushed by the entry stub, reverse push order
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    /// Interrupt vector, or the entry kind for syscall entries
    pub vector: u64,
    /// Hardware error code (0 when the vector pushes none)
    pub error_code: u64,

    // Hardware-pushed interrupt tail
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// A zeroed frame. Segment selectors and flags are filled in by the
    /// task-creation path.
    pub const fn new() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector: 0,
            error_code: 0,
            rip: 0,
            cs: 0,
            rflags: 0x202, // IF set, reserved bit 1
            rsp: 0,
            ss: 0,
        }
    }

    /// Syscall number (rdi by convention).
    #[inline]
    pub fn syscall_number(&self) -> u64 {
        self.rdi
    }

    /// The five syscall argument registers.
    #[inline]
    pub fn syscall_args(&self) -> [u64; 5] {
        [self.rsi, self.rdx, self.rcx, self.r8, self.r9]
    }

    /// Status register of the syscall return pair.
    #[inline]
    pub fn set_return_status(&mut self, status: i64) {
        self.rax = status as u64;
    }

    /// Value register of the syscall return pair.
    #[inline]
    pub fn set_return_value(&mut self, value: u64) {
        self.rdx = value;
    }

    /// Rewind the program counter so the syscall instruction re-executes
    /// when the task resumes.
    #[inline]
    pub fn rewind_syscall(&mut self) {
        self.rip -= SYSCALL_INSN_LEN;
    }

    /// Whether the frame came from ring 3.
    #[inline]
    pub fn from_user(&self) -> bool {
        self.cs & 0x3 == 3
    }
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrapFrame")
            .field("rip", &format_args!("{:#x}", self.rip))
            .field("rsp", &format_args!("{:#x}", self.rsp))
            .field("cs", &format_args!("{:#x}", self.cs))
            .field("rflags", &format_args!("{:#x}", self.rflags))
            .field("rax", &format_args!("{:#x}", self.rax))
            .field("rdi", &format_args!("{:#x}", self.rdi))
            .field("vector", &self.vector)
            .field("error_code", &format_args!("{:#x}", self.error_code))
            .finish()
    }
}

/// 512-byte FXSAVE area holding SSE/x87 state, saved lazily on context
/// switch.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FpuState(pub [u8; 512]);

impl FpuState {
    /// Initial state: default MXCSR (all exceptions masked), empty x87
    /// stack.
    pub const fn new() -> Self {
        let mut area = [0u8; 512];
        // FCW = 0x037f
        area[0] = 0x7f;
        area[1] = 0x03;
        // MXCSR = 0x1f80
        area[24] = 0x80;
        area[25] = 0x1f;
        Self(area)
    }

    /// Save the live FPU state into this area.
    ///
    /// # Safety
    /// - Must run on the CPU whose state is being saved
    #[cfg(not(test))]
    pub unsafe fn save(&mut self) {
        core::arch::asm!("fxsave64 [{}]", in(reg) self.0.as_mut_ptr(), options(nostack));
    }

    /// Restore this area into the live FPU.
    ///
    /// # Safety
    /// - The area must hold a state captured by `save` or `new`
    #[cfg(not(test))]
    pub unsafe fn restore(&self) {
        core::arch::asm!("fxrstor64 [{}]", in(reg) self.0.as_ptr(), options(nostack));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_matches_entry_stub() {
        // The entry stubs compute these offsets; keep them pinned.
        assert_eq!(core::mem::size_of::<TrapFrame>(), 22 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, vector), 15 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rip), 17 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, ss), 21 * 8);
    }

    #[test]
    fn syscall_registers() {
        let mut tf = TrapFrame::new();
        tf.rdi = 9;
        tf.rsi = 1;
        tf.rdx = 2;
        tf.rcx = 3;
        tf.r8 = 4;
        tf.r9 = 5;
        assert_eq!(tf.syscall_number(), 9);
        assert_eq!(tf.syscall_args(), [1, 2, 3, 4, 5]);

        tf.set_return_status(-16);
        tf.set_return_value(77);
        assert_eq!(tf.rax as i64, -16);
        assert_eq!(tf.rdx, 77);
    }

    #[test]
    fn rewind_backs_up_over_int() {
        let mut tf = TrapFrame::new();
        tf.rip = 0x401002;
        tf.rewind_syscall();
        assert_eq!(tf.rip, 0x401000);
    }

    #[test]
    fn ring_detection() {
        let mut tf = TrapFrame::new();
        tf.cs = 0x08;
        assert!(!tf.from_user());
        tf.cs = 0x2b;
        assert!(tf.from_user());
    }
}
