//! Stub library for the `calloc` fault-injection scenario
//! (`examples/original_source/samples/test3.c`): preloaded over a test
//! binary that allocates its only buffer with `calloc`.

covex_stub::interpose_allocator! {
    fn calloc(nmemb: usize, size: usize) -> *mut libc::c_void
    fail {
        unsafe { *libc::__errno_location() = libc::ENOMEM; }
        std::ptr::null_mut()
    }
}
