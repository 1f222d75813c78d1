//! Codegen macros translating `larmier_stub.h`'s preprocessor macro family
//! into Rust: each generates a `#[no_mangle] extern "C"` replacement for a
//! libc function, wired to the interpose protocol.
//!
//! A generated stub always needs `covex-stub` and `covex-bca` as
//! dependencies (`covex-bca` is re-exported from the crate root so one
//! dependency suffices).

/// Interpose a fixed-arity function.
///
/// ```ignore
/// covex_stub::interpose! {
///     fn tmpfile() -> *mut libc::FILE
///     fail { unsafe { *libc::__errno_location() = libc::ENOMEM; } std::ptr::null_mut() }
/// }
/// ```
#[macro_export]
macro_rules! interpose {
    (
        fn $name:ident ( $( $arg:ident : $arg_ty:ty ),* ) -> $ret:ty
        fail { $($fail_body:tt)* }
    ) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name( $( $arg : $arg_ty ),* ) -> $ret {
            static RESOLVED: once_cell::sync::OnceCell<usize> = once_cell::sync::OnceCell::new();
            let ctx = &$crate::context::CONTEXT;

            // Step 1: already resolving our own real implementation.
            if ctx.stub_off() {
                let real_ptr = $crate::resolver::resolve_cached(&RESOLVED, stringify!($name));
                let real: unsafe extern "C" fn($($arg_ty),*) -> $ret =
                    std::mem::transmute(real_ptr);
                return real($($arg),*);
            }

            // Step 2: caller-origin filter.
            if $crate::origin::should_skip_injection(ctx) {
                let real_ptr = $crate::resolver::resolve_cached(&RESOLVED, stringify!($name));
                let real: unsafe extern "C" fn($($arg_ty),*) -> $ret =
                    std::mem::transmute(real_ptr);
                return real($($arg),*);
            }

            // Step 3: resolve the real implementation, stubbing off while
            // doing so (the resolver itself must never be intercepted).
            let prev = ctx.set_stub_off(true);
            let real_ptr = $crate::resolver::resolve_cached(&RESOLVED, stringify!($name));
            ctx.set_stub_off(prev);
            let real: unsafe extern "C" fn($($arg_ty),*) -> $ret = std::mem::transmute(real_ptr);

            // Step 4: attach to the BCA; unavailable means "no injection
            // requested", forward directly.
            let bca_name = match std::env::var($crate::covex_bca::BCA_ENV_VAR) {
                Ok(v) => v,
                Err(_) => return real($($arg),*),
            };
            let bca = match $crate::covex_bca::Bca::attach(&bca_name, $crate::covex_bca::DEFAULT_LEN) {
                Some(b) => b,
                None => return real($($arg),*),
            };

            // Step 5: consult the schedule, then increment (Bca::next_decision
            // does both, in that order).
            let result = match bca.next_decision() {
                $crate::covex_bca::Decision::Fail => {
                    $crate::capture_fault_backtrace(stringify!($name));
                    (|| -> $ret { $($fail_body)* })()
                }
                _ => real($($arg),*),
            };

            // Step 6: detach (dropping `bca` unmaps; we never own the region).
            drop(bca);
            result
        }
    };
}

/// Interpose an allocator function (`calloc`, `malloc`, ...), adding the
/// reentrancy guard needed because the dynamic loader's own symbol lookup
/// can itself allocate.
///
/// ```ignore
/// covex_stub::interpose_allocator! {
///     fn calloc(nmemb: usize, size: usize) -> *mut libc::c_void
///     fail { unsafe { *libc::__errno_location() = libc::ENOMEM; } std::ptr::null_mut() }
/// }
/// ```
#[macro_export]
macro_rules! interpose_allocator {
    (
        fn $name:ident ( $( $arg:ident : $arg_ty:ty ),* ) -> $ret:ty
        fail { $($fail_body:tt)* }
    ) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name( $( $arg : $arg_ty ),* ) -> $ret {
            static RESOLVED: once_cell::sync::OnceCell<usize> = once_cell::sync::OnceCell::new();
            let ctx = &$crate::context::CONTEXT;

            // A nested call while already resolving means dlsym's own
            // machinery just tried to allocate. Synthesize a failure
            // instead of recursing.
            if ctx.in_resolver() {
                return (|| -> $ret { $($fail_body)* })();
            }

            let real_ptr = {
                let _guard = ctx.enter_resolver();
                $crate::resolver::resolve_cached(&RESOLVED, stringify!($name))
            };
            let real: unsafe extern "C" fn($($arg_ty),*) -> $ret = std::mem::transmute(real_ptr);

            if ctx.stub_off() || $crate::origin::should_skip_injection(ctx) {
                return real($($arg),*);
            }

            let bca_name = match std::env::var($crate::covex_bca::BCA_ENV_VAR) {
                Ok(v) => v,
                Err(_) => return real($($arg),*),
            };
            let bca = match $crate::covex_bca::Bca::attach(&bca_name, $crate::covex_bca::DEFAULT_LEN) {
                Some(b) => b,
                None => return real($($arg),*),
            };

            match bca.next_decision() {
                $crate::covex_bca::Decision::Fail => {
                    $crate::capture_fault_backtrace(stringify!($name));
                    (|| -> $ret { $($fail_body)* })()
                }
                _ => real($($arg),*),
            }
        }
    };
}

/// Interpose a C-variadic function (e.g. an `asprintf`-style helper).
///
/// Requires the nightly `c_variadic` feature (rust-lang/rust#44930), since
/// stable Rust cannot define an `extern "C"` function accepting `...`.
/// Gated behind the `variadic-stubs` Cargo feature; see `DESIGN.md`.
#[cfg(feature = "variadic-stubs")]
#[macro_export]
macro_rules! interpose_variadic {
    (
        fn $name:ident ( $( $arg:ident : $arg_ty:ty ),* , ... ) -> $ret:ty via $real_name:literal
        fail { $($fail_body:tt)* }
    ) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name( $( $arg : $arg_ty, )* mut args: ... ) -> $ret {
            static RESOLVED: once_cell::sync::OnceCell<usize> = once_cell::sync::OnceCell::new();
            let ctx = &$crate::context::CONTEXT;

            type RealFn = unsafe extern "C" fn($($arg_ty,)* ...) -> $ret;
            let real_ptr = $crate::resolver::resolve_cached(&RESOLVED, $real_name);
            let real: RealFn = std::mem::transmute(real_ptr);

            if ctx.stub_off() || $crate::origin::should_skip_injection(ctx) {
                return real($($arg,)* args);
            }

            let bca_name = match std::env::var($crate::covex_bca::BCA_ENV_VAR) {
                Ok(v) => v,
                Err(_) => return real($($arg,)* args),
            };
            let bca = match $crate::covex_bca::Bca::attach(&bca_name, $crate::covex_bca::DEFAULT_LEN) {
                Some(b) => b,
                None => return real($($arg,)* args),
            };

            match bca.next_decision() {
                $crate::covex_bca::Decision::Fail => {
                    $crate::capture_fault_backtrace(stringify!($name));
                    (|| -> $ret { $($fail_body)* })()
                }
                _ => real($($arg,)* args),
            }
        }
    };
}
