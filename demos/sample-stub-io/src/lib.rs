//! Stub library for the tmpfile/strdup/fputs fault-injection scenario
//! (`examples/original_source/samples/test2.c` and `test2_stub.c`):
//! preloaded over a test binary that opens a temp file, duplicates a
//! string, then writes it to the file.

covex_stub::interpose! {
    fn tmpfile() -> *mut libc::FILE
    fail {
        unsafe { *libc::__errno_location() = libc::ENOSPC; }
        std::ptr::null_mut()
    }
}

covex_stub::interpose! {
    fn strdup(s: *const libc::c_char) -> *mut libc::c_char
    fail {
        unsafe { *libc::__errno_location() = libc::ENOMEM; }
        std::ptr::null_mut()
    }
}

covex_stub::interpose! {
    fn fputs(s: *const libc::c_char, stream: *mut libc::FILE) -> libc::c_int
    fail {
        unsafe { *libc::__errno_location() = libc::EIO; }
        -1
    }
}
