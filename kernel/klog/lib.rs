//! Kernel logging (`klog`).
//!
//! Leveled, profile-gated logging macros for kernel sub-crates that must not
//! print unconditionally. The crate has no output device of its own: the boot
//! path installs a sink with [`install_sink`] (console, UART, ring buffer) and
//! every macro funnels into it. Until a sink is installed, output is dropped.
//!
//! # Macros
//!
//! | Macro | Release build | Filtered by profile | Typical use |
//! |-------|---------------|---------------------|-------------|
//! | [`klog!`] | `Info`..`Error` only | Yes | Operational logging |
//! | [`klog_always!`] | Active | Off in `Secure` | Banners, status lines |
//! | [`klog_force!`] | Active | No | Messages right before a `panic!` |
//! | [`kprintln!`] | Compiled out | No | Developer diagnostics |
//!
//! # Profiles
//!
//! [`set_profile`] derives the runtime level filter:
//!
//! - **Secure**: nothing is printed
//! - **Balanced**: `Error` + `Warn`
//! - **Performance**: everything
//!
//! The filter check is one `Relaxed` load and a compare, cheap enough for
//! text-patching paths that run with interrupts masked.
//!
//! # Pointer Safety
//!
//! Kernel addresses leak the KASLR slide. Wrap them in [`Kptr`] before
//! formatting at `Info` and above:
//!
//! ```ignore
//! klog!(Error, "text write at {} denied", Kptr(addr));
//! ```
//!
//! [`Kptr`] prints a placeholder unless [`set_kptr_raw`] allowed raw output.
//! Raw `{:#x}` addresses are only acceptable in `Debug`/`Trace` messages,
//! which release builds compile out.

#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use spin::Once;

// ============================================================================
// Levels and profiles
// ============================================================================

/// Severity of a [`klog!`] message, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Very verbose tracing (debug builds only).
    Trace = 0,
    /// Developer detail (debug builds only).
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

/// Hardening profile the log filter is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KlogProfile {
    Secure = 0,
    Balanced = 1,
    Performance = 2,
}

const LEVEL_DISABLED: u8 = u8::MAX;

/// Messages with `level >= LOG_MIN_LEVEL` are emitted. Starts disabled.
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Gate for [`klog_always!`]; false until a non-Secure profile is set.
static LOG_ALWAYS_ENABLED: AtomicBool = AtomicBool::new(false);

static SINK: Once<fn(fmt::Arguments<'_>)> = Once::new();

/// Whether [`Kptr`] prints the real address.
static KPTR_RAW: AtomicBool = AtomicBool::new(false);

/// Apply a profile. May be called again when the profile changes.
#[inline]
pub fn set_profile(profile: KlogProfile) {
    let min = match profile {
        KlogProfile::Secure => LEVEL_DISABLED,
        KlogProfile::Balanced => Level::Warn as u8,
        KlogProfile::Performance => Level::Trace as u8,
    };
    LOG_MIN_LEVEL.store(min, Ordering::Release);
    LOG_ALWAYS_ENABLED.store(profile != KlogProfile::Secure, Ordering::Release);
}

/// Turn off all leveled output. [`klog_always!`] and [`klog_force!`] are unaffected.
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

/// Install the output sink. Only the first call has an effect.
pub fn install_sink(sink: fn(fmt::Arguments<'_>)) {
    SINK.call_once(|| sink);
}

/// Returns `true` once a sink has been installed.
pub fn has_sink() -> bool {
    SINK.get().is_some()
}

/// Allow or forbid [`Kptr`] from printing real addresses.
pub fn set_kptr_raw(raw: bool) {
    KPTR_RAW.store(raw, Ordering::Release);
}

/// A kernel address that is redacted when formatted, unless raw output is on.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Kptr(pub usize);

impl fmt::Display for Kptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if KPTR_RAW.load(Ordering::Relaxed) {
            write!(f, "{:#x}", self.0)
        } else {
            f.write_str("(ptrval)")
        }
    }
}

impl fmt::Debug for Kptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ============================================================================
// Macro plumbing (not public API)
// ============================================================================

#[doc(hidden)]
#[inline(always)]
pub fn _klog_always_enabled() -> bool {
    LOG_ALWAYS_ENABLED.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline]
pub fn _klog_print(args: fmt::Arguments<'_>) {
    if let Some(sink) = SINK.get() {
        sink(args);
    }
}

// ============================================================================
// Macros
// ============================================================================

/// Profile-gated output for banners and status lines. Silent in `Secure`.
#[macro_export]
macro_rules! klog_always {
    () => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_print(format_args!("\n"));
        }
    }};
    ($($arg:tt)+) => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

/// Unconditional output. Reserve for diagnostics that precede a `panic!`.
#[macro_export]
macro_rules! klog_force {
    () => {{
        $crate::_klog_print(format_args!("\n"));
    }};
    ($($arg:tt)+) => {{
        $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
    }};
}

/// Debug-build-only print; expands to nothing in release builds.
#[macro_export]
macro_rules! kprintln {
    () => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!();
    }};
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)+);
    }};
}

/// Leveled, profile-filtered logging.
///
/// ```ignore
/// klog!(Error, "livepatch: func {} is in use!", name);
/// klog!(Debug, "livepatch: node created at {:#x}", addr);
/// ```
#[macro_export]
macro_rules! klog {
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Debug) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Trace) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}
