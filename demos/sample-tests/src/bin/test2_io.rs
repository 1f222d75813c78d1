//! Rust translation of `examples/original_source/samples/test2.c`: opens a
//! temp file, duplicates a string, and writes it to the file, with fault
//! injection enabled across all three calls. Pair with `sample-stub-io`.

use std::ffi::CString;

const MYSTRING: &str = "This is my string";

fn main() {
    covex_stub::set_enabled(true);

    // SAFETY: tmpfile's return value is checked before use.
    let fp = unsafe { libc::tmpfile() };
    if fp.is_null() {
        covex_stub::set_enabled(false);
        eprintln!("tmpfile: {}", std::io::Error::last_os_error());
        std::process::exit(1);
    }

    let cstring = CString::new(MYSTRING).expect("no interior NUL");
    // SAFETY: `cstring` outlives this call.
    let dup = unsafe { libc::strdup(cstring.as_ptr()) };
    if dup.is_null() {
        covex_stub::set_enabled(false);
        eprintln!("strdup: {}", std::io::Error::last_os_error());
        // SAFETY: `fp` is a valid, still-open FILE*.
        unsafe { libc::fclose(fp) };
        std::process::exit(1);
    }

    // SAFETY: `dup` and `fp` are both valid for the duration of this call.
    let written = unsafe { libc::fputs(dup, fp) };
    covex_stub::set_enabled(false);

    let ret = if written < 0 {
        eprintln!("fputs: {}", std::io::Error::last_os_error());
        1
    } else {
        0
    };

    // SAFETY: `dup` came from strdup (malloc-backed); `fp` is still open.
    unsafe {
        libc::free(dup as *mut libc::c_void);
        libc::fclose(fp);
    }

    std::process::exit(ret);
}
