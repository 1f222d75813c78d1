//! Process-wide state every generated stub consults. Initialized explicitly
//! through `once_cell::sync::Lazy` rather than relying on implicit global
//! constructor order (spec's Design Note on initialization ordering).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::{Lazy, OnceCell};

pub struct StubContext {
    stub_off: AtomicBool,
    in_resolver: AtomicBool,
    exe_path: OnceCell<Option<PathBuf>>,
}

impl Default for StubContext {
    fn default() -> Self {
        Self {
            stub_off: AtomicBool::new(false),
            in_resolver: AtomicBool::new(false),
            exe_path: OnceCell::new(),
        }
    }
}

impl StubContext {
    /// `true` while a stub is resolving its own real implementation; a
    /// nested call into the same stub during that window must forward
    /// directly rather than recurse.
    pub fn stub_off(&self) -> bool {
        self.stub_off.load(Ordering::SeqCst)
    }

    /// Set the flag, returning its previous value so callers can restore it.
    pub fn set_stub_off(&self, value: bool) -> bool {
        self.stub_off.swap(value, Ordering::SeqCst)
    }

    pub fn in_resolver(&self) -> bool {
        self.in_resolver.load(Ordering::SeqCst)
    }

    /// RAII guard marking "inside the dynamic symbol resolver", for the
    /// allocator reentrancy special case: `dlsym` itself can allocate.
    pub fn enter_resolver(&self) -> ResolverGuard<'_> {
        self.in_resolver.store(true, Ordering::SeqCst);
        ResolverGuard { ctx: self }
    }

    /// The test executable's own path, resolved once via
    /// `std::env::current_exe` and cached for the life of the process.
    pub fn test_executable_path(&self) -> Option<&Path> {
        self.exe_path
            .get_or_init(|| std::env::current_exe().ok())
            .as_deref()
    }
}

pub struct ResolverGuard<'a> {
    ctx: &'a StubContext,
}

impl Drop for ResolverGuard<'_> {
    fn drop(&mut self) {
        self.ctx.in_resolver.store(false, Ordering::SeqCst);
    }
}

/// The single process-wide context every generated stub consults.
pub static CONTEXT: Lazy<StubContext> = Lazy::new(StubContext::default);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_stub_off_returns_previous_value() {
        let ctx = StubContext::default();
        assert!(!ctx.set_stub_off(true));
        assert!(ctx.set_stub_off(false));
        assert!(!ctx.stub_off());
    }

    #[test]
    fn resolver_guard_resets_on_drop() {
        let ctx = StubContext::default();
        assert!(!ctx.in_resolver());
        {
            let _guard = ctx.enter_resolver();
            assert!(ctx.in_resolver());
        }
        assert!(!ctx.in_resolver());
    }

    #[test]
    fn test_executable_path_is_cached() {
        let ctx = StubContext::default();
        let first = ctx.test_executable_path().map(Path::to_path_buf);
        let second = ctx.test_executable_path().map(Path::to_path_buf);
        assert_eq!(first, second);
    }
}
