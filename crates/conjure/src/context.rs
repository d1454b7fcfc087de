// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Machine context save/restore.
//!
//! This is the only architecture-specific part of the runtime. Everything
//! above talks to `Registers::prepare` and `switch`.
//!
//! Supported targets:
//! - x86_64 System V: rsp, rbp, rbx, r12-r15
//! - aarch64 AAPCS64: x19-x30, sp, d8-d15
//!
//! A fresh context starts in `conjure_context_bootstrap`, which moves the
//! argument into the first parameter register and calls the entry function.
//! Entry functions never return.

use std::arch::global_asm;

use crate::stack::Stack;

/// Entry point of a fresh context. Receives the argument given to `prepare`.
pub type Entry = extern "C" fn(usize) -> !;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("conjure supports only x86_64 and aarch64");

/// Callee-saved register snapshot.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Default)]
pub struct Registers {
    rsp: usize,
    rbp: usize,
    rbx: usize,
    r12: usize,
    r13: usize,
    r14: usize,
    r15: usize,
}

/// Callee-saved register snapshot.
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Default)]
pub struct Registers {
    x: [usize; 12],
    sp: usize,
    d: [u64; 8],
}

extern "C" {
    fn conjure_context_switch(from: *mut Registers, to: *const Registers);
    fn conjure_context_bootstrap();
}

impl Registers {
    /// Set up a context that will run `entry(arg)` on `stack` the first
    /// time it is switched to.
    #[cfg(target_arch = "x86_64")]
    pub fn prepare(stack: &Stack, entry: Entry, arg: usize) -> Self {
        let start = stack.start() as *mut usize;
        // SAFETY: start lies inside the usable part of the stack; `ret` in
        // the switch routine pops this slot.
        unsafe { start.write(conjure_context_bootstrap as usize) };
        Self {
            rsp: start as usize,
            rbp: 0,
            rbx: 0,
            r12: arg,
            r13: entry as usize,
            r14: 0,
            r15: 0,
        }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn prepare(stack: &Stack, entry: Entry, arg: usize) -> Self {
        let mut regs = Self::default();
        regs.x[0] = arg; // x19
        regs.x[1] = entry as usize; // x20
        regs.x[11] = conjure_context_bootstrap as usize; // x30
        regs.sp = stack.end() as usize & !(crate::stack::STACK_ALIGN - 1);
        regs
    }
}

/// Save the current machine state into `from` and resume `to`.
///
/// Returns when some later switch names `from` as its target.
///
/// # Safety
/// `to` must hold a context produced by `Registers::prepare` or by an
/// earlier `switch`, whose stack is still mapped. Neither pointer may be
/// invalidated while the other side runs.
pub unsafe fn switch(from: *mut Registers, to: *const Registers) {
    conjure_context_switch(from, to);
}

#[cfg(target_arch = "x86_64")]
global_asm!(
    ".text",
    ".global conjure_context_switch",
    ".p2align 4",
    "conjure_context_switch:",
    "mov [rdi + 0x00], rsp",
    "mov [rdi + 0x08], rbp",
    "mov [rdi + 0x10], rbx",
    "mov [rdi + 0x18], r12",
    "mov [rdi + 0x20], r13",
    "mov [rdi + 0x28], r14",
    "mov [rdi + 0x30], r15",
    "mov rsp, [rsi + 0x00]",
    "mov rbp, [rsi + 0x08]",
    "mov rbx, [rsi + 0x10]",
    "mov r12, [rsi + 0x18]",
    "mov r13, [rsi + 0x20]",
    "mov r14, [rsi + 0x28]",
    "mov r15, [rsi + 0x30]",
    "ret",
    "",
    ".global conjure_context_bootstrap",
    ".p2align 4",
    "conjure_context_bootstrap:",
    "mov rdi, r12",
    "and rsp, -16",
    "call r13",
    "ud2",
);

#[cfg(target_arch = "aarch64")]
global_asm!(
    ".text",
    ".global conjure_context_switch",
    ".p2align 4",
    "conjure_context_switch:",
    "stp x19, x20, [x0, #0x00]",
    "stp x21, x22, [x0, #0x10]",
    "stp x23, x24, [x0, #0x20]",
    "stp x25, x26, [x0, #0x30]",
    "stp x27, x28, [x0, #0x40]",
    "stp x29, x30, [x0, #0x50]",
    "mov x9, sp",
    "str x9, [x0, #0x60]",
    "stp d8, d9, [x0, #0x68]",
    "stp d10, d11, [x0, #0x78]",
    "stp d12, d13, [x0, #0x88]",
    "stp d14, d15, [x0, #0x98]",
    "ldp x19, x20, [x1, #0x00]",
    "ldp x21, x22, [x1, #0x10]",
    "ldp x23, x24, [x1, #0x20]",
    "ldp x25, x26, [x1, #0x30]",
    "ldp x27, x28, [x1, #0x40]",
    "ldp x29, x30, [x1, #0x50]",
    "ldr x9, [x1, #0x60]",
    "mov sp, x9",
    "ldp d8, d9, [x1, #0x68]",
    "ldp d10, d11, [x1, #0x78]",
    "ldp d12, d13, [x1, #0x88]",
    "ldp d14, d15, [x1, #0x98]",
    "ret",
    "",
    ".global conjure_context_bootstrap",
    ".p2align 4",
    "conjure_context_bootstrap:",
    "mov x0, x19",
    "blr x20",
    "brk #0",
);

#[cfg(test)]
mod tests {
    use super::*;

    struct PingPong {
        main: Registers,
        coro: Registers,
        hits: usize,
        arg_seen: usize,
    }

    extern "C" fn bounce(arg: usize) -> ! {
        let pp = arg as *mut PingPong;
        unsafe {
            (*pp).arg_seen = arg;
            loop {
                (*pp).hits += 1;
                switch(&mut (*pp).coro, &(*pp).main);
            }
        }
    }

    #[test]
    fn switch_into_fresh_context_and_back() {
        let stack = Stack::new(32 * 1024);
        let mut pp = Box::new(PingPong {
            main: Registers::default(),
            coro: Registers::default(),
            hits: 0,
            arg_seen: 0,
        });
        let arg = &mut *pp as *mut PingPong as usize;
        pp.coro = Registers::prepare(&stack, bounce, arg);

        for round in 1..=5 {
            unsafe { switch(&mut pp.main, &pp.coro) };
            assert_eq!(pp.hits, round);
        }
        assert_eq!(pp.arg_seen, arg);
    }

    extern "C" fn float_work(arg: usize) -> ! {
        let pp = arg as *mut PingPong;
        let mut acc = 0.5f64;
        unsafe {
            loop {
                acc *= 2.0;
                (*pp).hits = acc as usize;
                switch(&mut (*pp).coro, &(*pp).main);
            }
        }
    }

    #[test]
    fn locals_survive_across_switches() {
        let stack = Stack::new(32 * 1024);
        let mut pp = Box::new(PingPong {
            main: Registers::default(),
            coro: Registers::default(),
            hits: 0,
            arg_seen: 0,
        });
        let arg = &mut *pp as *mut PingPong as usize;
        pp.coro = Registers::prepare(&stack, float_work, arg);

        let local = 7usize;
        unsafe { switch(&mut pp.main, &pp.coro) };
        assert_eq!(pp.hits, 1);
        unsafe { switch(&mut pp.main, &pp.coro) };
        unsafe { switch(&mut pp.main, &pp.coro) };
        assert_eq!(pp.hits, 4);
        assert_eq!(local, 7);
    }
}
