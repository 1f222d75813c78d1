//! Dynamic symbol resolution: finds the real (non-stubbed) implementation
//! of an intercepted function via `RTLD_NEXT`.

use std::ffi::CString;

use once_cell::sync::OnceCell;

/// Resolve `name`'s real implementation, caching the result in `cell` so
/// repeated calls from the same generated stub don't re-enter the dynamic
/// loader.
pub fn resolve_cached(cell: &OnceCell<usize>, name: &str) -> usize {
    *cell.get_or_init(|| resolve_next(name))
}

fn resolve_next(name: &str) -> usize {
    let cname = CString::new(name).expect("symbol name must not contain NUL");
    // SAFETY: RTLD_NEXT is a valid pseudo-handle understood by dlsym. The
    // returned pointer is only ever transmuted to a function pointer by
    // callers that already know the correct signature for `name`.
    unsafe { libc::dlsym(libc::RTLD_NEXT, cname.as_ptr()) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_cached_finds_a_known_libc_symbol() {
        let cell = OnceCell::new();
        let ptr = resolve_cached(&cell, "malloc");
        assert_ne!(ptr, 0, "malloc should resolve via RTLD_NEXT");
    }

    #[test]
    fn resolve_cached_memoizes() {
        let cell = OnceCell::new();
        let first = resolve_cached(&cell, "free");
        let second = resolve_cached(&cell, "free");
        assert_eq!(first, second);
    }
}
