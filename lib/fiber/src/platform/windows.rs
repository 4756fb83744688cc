//! Win32 fiber backend.
//!
//! The OS owns the context and stack here; we only keep a small block
//! pairing the fiber handle with its pending entry closure so that every
//! platform exposes the same opaque id to the crate root.

use crate::EntryFn;
use std::process;
use std::ptr;
use winapi::shared::minwindef::LPVOID;
use winapi::um::winbase::{
    ConvertFiberToThread, ConvertThreadToFiber, CreateFiber, DeleteFiber, SwitchToFiber,
};

pub type PlatformId = *mut Context;

pub struct Context {
    handle: LPVOID,
    entry: Option<EntryFn>,
    is_thread: bool,
}

pub fn init_thread() -> PlatformId {
    let handle = unsafe { ConvertThreadToFiber(ptr::null_mut()) };
    if handle.is_null() {
        log::error!("ConvertThreadToFiber failed");
        process::abort();
    }
    Box::into_raw(Box::new(Context {
        handle,
        entry: None,
        is_thread: true,
    }))
}

pub unsafe fn destroy_thread(id: PlatformId) {
    debug_assert!((*id).is_thread);
    ConvertFiberToThread();
    drop(Box::from_raw(id));
}

pub fn create_fiber(stack_size: usize, entry: EntryFn) -> PlatformId {
    let context = Box::into_raw(Box::new(Context {
        handle: ptr::null_mut(),
        entry: Some(entry),
        is_thread: false,
    }));

    let handle = unsafe { CreateFiber(stack_size, Some(fiber_trampoline), context as LPVOID) };
    if handle.is_null() {
        log::error!("CreateFiber failed (stack size {})", stack_size);
        process::abort();
    }

    unsafe {
        (*context).handle = handle;
    }
    context
}

pub unsafe fn destroy_fiber(id: PlatformId) {
    debug_assert!(!(*id).is_thread);
    DeleteFiber((*id).handle);
    drop(Box::from_raw(id));
}

pub unsafe fn switch(_from: PlatformId, to: PlatformId) {
    SwitchToFiber((*to).handle);
}

pub unsafe fn take_entry(id: PlatformId) -> EntryFn {
    (*id).entry.take().expect("fiber entered twice")
}

unsafe extern "system" fn fiber_trampoline(_parameter: LPVOID) {
    crate::fiber_main();
}
