//! ucontext backend (linux-gnu).
//!
//! `getcontext`/`makecontext`/`swapcontext` are the POSIX cousins of the
//! Win32 fiber calls: a context block plus a caller-provided stack, with an
//! explicit swap that saves the current machine state into one block and
//! restores another. `makecontext` only forwards `int` arguments, so the
//! trampoline takes none and recovers its state through the crate's
//! thread-locals, which the switching side fills in before every swap.

use crate::EntryFn;
use std::mem;
use std::process;
use std::ptr;

pub type PlatformId = *mut Context;

pub struct Context {
    ucp: libc::ucontext_t,
    entry: Option<EntryFn>,
    // Keeps the stack allocation alive for the fiber's lifetime. `None` for
    // thread fibers, which run on the OS-provided stack.
    stack: Option<Box<[u8]>>,
}

pub fn init_thread() -> PlatformId {
    // The block is filled in place by `swapcontext` the first time the
    // thread fiber switches away; until then its contents don't matter.
    let context = Box::new(Context {
        ucp: unsafe { mem::zeroed() },
        entry: None,
        stack: None,
    });
    Box::into_raw(context)
}

pub unsafe fn destroy_thread(id: PlatformId) {
    drop(Box::from_raw(id));
}

pub fn create_fiber(stack_size: usize, entry: EntryFn) -> PlatformId {
    let mut context = Box::new(Context {
        ucp: unsafe { mem::zeroed() },
        entry: Some(entry),
        stack: Some(vec![0u8; stack_size].into_boxed_slice()),
    });

    unsafe {
        if libc::getcontext(&mut context.ucp) != 0 {
            log::error!("getcontext failed while creating a fiber");
            process::abort();
        }

        // An initialized ucontext_t holds pointers into itself; the block
        // is heap-allocated and handled by address from here on so it can
        // never move.
        let stack = context.stack.as_mut().unwrap();
        context.ucp.uc_stack.ss_sp = stack.as_mut_ptr() as *mut libc::c_void;
        context.ucp.uc_stack.ss_size = stack.len();
        context.ucp.uc_link = ptr::null_mut();
        libc::makecontext(&mut context.ucp, fiber_trampoline, 0);
    }

    Box::into_raw(context)
}

pub unsafe fn destroy_fiber(id: PlatformId) {
    drop(Box::from_raw(id));
}

pub unsafe fn switch(from: PlatformId, to: PlatformId) {
    if libc::swapcontext(&mut (*from).ucp, &(*to).ucp) != 0 {
        log::error!("swapcontext failed");
        process::abort();
    }
}

pub unsafe fn take_entry(id: PlatformId) -> EntryFn {
    (*id).entry.take().expect("fiber entered twice")
}

extern "C" fn fiber_trampoline() {
    crate::fiber_main();
}
