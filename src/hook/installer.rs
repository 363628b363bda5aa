//! Installing interceptors on native entry points
//!
//! Each [`HookTarget`] owns one static slot and one `extern "C"` detour
//! function. The detour forwards four integer registers, which covers both
//! hooked shapes (an instance or static call of one or two object arguments
//! plus the trailing `MethodInfo*`) on x64 Windows and SysV.
//!
//! A site, once published, is never freed: a thread may still be inside the
//! detour when the hook is removed, and it has to find its trampoline.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use retour::GenericDetour;
use thiserror::Error;

use super::interceptor::{Arguments, Interceptor, FORWARDED_ARGS};
use super::HookTarget;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("{0} is already hooked")]
    AlreadyInstalled(HookTarget),
    #[error("entry point 0x{0:x} is not hookable")]
    InvalidTarget(usize),
    #[error("detour failed: {0}")]
    Detour(#[from] retour::Error),
}

/// A hook that can be taken out again
pub trait InstalledHook: Send {
    fn target(&self) -> HookTarget;

    /// Stop intercepting future calls. Calls already inside the hook finish normally.
    fn remove(&self) -> Result<(), HookError>;
}

/// Installs an interceptor at a native entry point
pub trait HookInstaller {
    fn install(
        &self,
        target: HookTarget,
        entry_point: usize,
        interceptor: Box<dyn Interceptor>,
    ) -> Result<Box<dyn InstalledHook>, HookError>;
}

/// Run an interceptor around the original call
///
/// Panics in either callback are contained; the original is always called
/// exactly once and its return value is passed through untouched.
pub fn run_site<F>(interceptor: &dyn Interceptor, args: Arguments, original: F) -> usize
where
    F: FnOnce([usize; FORWARDED_ARGS]) -> usize,
{
    contain(|| interceptor.on_enter(&args));
    let retval = original(args.raw());
    contain(|| interceptor.on_leave(retval));
    retval
}

fn contain<F: FnOnce()>(callback: F) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        tracing::trace!("interceptor panicked");
    }
}

type RawMethod = unsafe extern "C" fn(usize, usize, usize, usize) -> usize;

struct HookSite {
    target: HookTarget,
    detour: GenericDetour<RawMethod>,
    interceptor: Box<dyn Interceptor>,
}

static SITES: [AtomicPtr<HookSite>; HookTarget::COUNT] =
    [AtomicPtr::new(ptr::null_mut()), AtomicPtr::new(ptr::null_mut())];

unsafe extern "C" fn decompress_response_detour(a0: usize, a1: usize, a2: usize, a3: usize) -> usize {
    dispatch(HookTarget::DecompressResponse, [a0, a1, a2, a3])
}

unsafe extern "C" fn compress_request_detour(a0: usize, a1: usize, a2: usize, a3: usize) -> usize {
    dispatch(HookTarget::CompressRequest, [a0, a1, a2, a3])
}

fn detour_for(target: HookTarget) -> RawMethod {
    match target {
        HookTarget::DecompressResponse => decompress_response_detour,
        HookTarget::CompressRequest => compress_request_detour,
    }
}

fn dispatch(target: HookTarget, raw: [usize; FORWARDED_ARGS]) -> usize {
    // Safety: the detour only becomes reachable after its site was published,
    // and published sites are leaked.
    let site = unsafe { &*SITES[target.index()].load(Ordering::Acquire) };
    run_site(site.interceptor.as_ref(), Arguments::new(raw), |args| unsafe {
        site.detour.call(args[0], args[1], args[2], args[3])
    })
}

/// Production installer backed by `retour` inline detours
#[derive(Debug, Default, Clone, Copy)]
pub struct DetourInstaller;

struct DetourHook {
    site: &'static HookSite,
}

// Safety: the site is immutable once published; enable/disable only happen
// from the session that owns this hook.
unsafe impl Send for DetourHook {}

impl InstalledHook for DetourHook {
    fn target(&self) -> HookTarget {
        self.site.target
    }

    fn remove(&self) -> Result<(), HookError> {
        if self.site.detour.is_enabled() {
            unsafe { self.site.detour.disable()? };
            tracing::info!(hook = %self.site.target, "hook removed");
        }
        Ok(())
    }
}

impl HookInstaller for DetourInstaller {
    fn install(
        &self,
        target: HookTarget,
        entry_point: usize,
        interceptor: Box<dyn Interceptor>,
    ) -> Result<Box<dyn InstalledHook>, HookError> {
        if entry_point == 0 {
            return Err(HookError::InvalidTarget(entry_point));
        }

        let slot = &SITES[target.index()];
        let previous = slot.load(Ordering::Acquire);
        if !previous.is_null() && unsafe { (*previous).detour.is_enabled() } {
            return Err(HookError::AlreadyInstalled(target));
        }

        // Safety: entry_point is the methodPointer of a resolved MethodInfo,
        // which the runtime calls with the C calling convention.
        let original = unsafe { std::mem::transmute::<usize, RawMethod>(entry_point) };
        let detour = unsafe { GenericDetour::new(original, detour_for(target))? };

        let site: &'static HookSite = Box::leak(Box::new(HookSite {
            target,
            detour,
            interceptor,
        }));
        slot.store(site as *const HookSite as *mut HookSite, Ordering::Release);

        unsafe { site.detour.enable()? };
        tracing::info!(hook = %target, entry_point = format!("0x{:x}", entry_point), "hook installed");
        Ok(Box::new(DetourHook { site }))
    }
}
