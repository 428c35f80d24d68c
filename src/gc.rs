//! A minimal stand-in for the runtime's string interner.
//!
//! The real garbage collector — heap tracing, object headers, the native-function registry — is
//! explicitly out of scope for this crate (see spec §1, §5): it belongs to the VM. What the
//! compiler *does* need, because it builds constant pools containing strings, is the interner's
//! interface: `copy_string(bytes) -> Rc<str>`, returning a canonical, deduplicated handle. This
//! module provides exactly that, following the teacher's "active GC" pattern (a guarded process
//! singleton,  installed for the duration of one compile), but backed by `Rc<str>` rather than the
//! teacher's lifetime-laundering `&'static str` hack, since `Rc` already gives the canonical-handle
//! semantics the compiler needs without unsafe lifetime claims.

use std::collections::HashSet;
use std::rc::Rc;

/// The string interner. Outside of tests, exactly one of these is installed at a time via
/// [ActiveGC::install].
#[derive(Clone, Debug, Default)]
pub struct GC {
    strings: HashSet<Rc<str>>,
}

/// A token that indicates that the global static [GC] has been installed. The only way to obtain
/// this token is to install the GC (for example, by calling [ActiveGC::install]).
/// When this token is dropped, the global static GC will be uninstalled and dropped.
///
/// ```
/// use rlox::gc::ActiveGC;
///
/// let gc = ActiveGC::install();
/// assert_eq!(0, ActiveGC::n_strings());
///
/// let s = ActiveGC::copy_string("hello");
/// assert_eq!("hello", &*s);
/// assert_eq!(1, ActiveGC::n_strings());
/// // when `gc` goes out of scope, the GC is automatically uninstalled.
/// ```
#[derive(Debug)]
pub struct ActiveGC(());

/// The actual static (global) [GC] instance. Install with [GC::into_active_gc].
static mut ACTIVE_GC: Option<GC> = None;

impl GC {
    /// Returns the canonical [Rc<str>] for `text`, interning it if this is the first time it has
    /// been seen. This is the compiler-facing `copyString` from spec §3/§4.2.
    pub fn copy_string(&mut self, text: &str) -> Rc<str> {
        if let Some(existing) = self.strings.get(text) {
            return existing.clone();
        }

        let interned: Rc<str> = Rc::from(text);
        self.strings.insert(interned.clone());
        interned
    }

    /// Consume self and convert it into the [ActiveGC].
    #[must_use]
    pub fn into_active_gc(self) -> ActiveGC {
        unsafe {
            ACTIVE_GC = Some(self);
        }
        ActiveGC(())
    }

    /// Return how many distinct strings are currently interned.
    fn n_strings(&self) -> usize {
        self.strings.len()
    }
}

impl ActiveGC {
    /// Create a [GC] and install it as the active GC.
    ///
    /// # Panics
    ///
    /// Only one [GC] instance can be active at a time. The process panics
    /// **non-deterministically** if you try to install a [GC] while one is already installed.
    #[must_use]
    pub fn install() -> ActiveGC {
        GC::default().into_active_gc()
    }

    ///////////////////////////////////////////////////////////////////////////////////////////////
    // The following methods delegate to the active GC instance:
    ///////////////////////////////////////////////////////////////////////////////////////////////

    /// Intern a string in the active [GC], returning its canonical handle.
    pub fn copy_string(s: &str) -> Rc<str> {
        Self::get().copy_string(s)
    }

    /// Return how many distinct strings are currently interned.
    pub fn n_strings() -> usize {
        Self::get().n_strings()
    }

    /// Get the current active [GC].
    fn get() -> &'static mut GC {
        unsafe { &mut ACTIVE_GC }
            .as_mut()
            .expect("Tried to get active GC, but it's not installed")
    }
}

impl Drop for ActiveGC {
    fn drop(&mut self) {
        // Uninstall the GC by taking ownership of it.
        unsafe {
            ACTIVE_GC
                .take()
                .expect("Trying to drop active GC, but it's not installed")
        };
        // GC dropped here!
    }
}

#[cfg(test)]
mod test {
    // Since the active GC is SHARED, MUTABLE STATE 👹, these tests **must** run in serial, or else
    // they will trample over each others' GC :/
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_gc() {
        let mut gc = GC::default();
        let s = gc.copy_string("hello");
        assert_eq!("hello", &*s);
        assert_eq!(1, gc.n_strings());
    }

    #[test]
    #[serial]
    fn interning_deduplicates() {
        let mut gc = GC::default();
        let a = gc.copy_string("hello");
        let b = gc.copy_string("hello");
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(1, gc.n_strings());
    }

    #[test]
    #[serial]
    fn test_ownership() {
        let gc = GC::default();
        let _active_gc = gc.into_active_gc();

        let s = ActiveGC::copy_string("🦀");
        assert_eq!("🦀", &*s);
        assert_eq!(1, ActiveGC::n_strings());
    }

    #[test]
    #[serial]
    #[should_panic(expected = "Tried to get active GC")]
    fn test_using_active_gc_when_not_installed() {
        ActiveGC::copy_string("🎷");
    }

    #[test]
    #[serial]
    #[should_panic(expected = "Tried to get active GC")]
    fn test_using_active_gc_after_drop() {
        let gc = GC::default();
        {
            let _active_gc = gc.into_active_gc();
            assert_eq!(0, ActiveGC::n_strings());
        }

        ActiveGC::copy_string("🍕");
    }
}
