//! Rust translation of `examples/original_source/samples/test3.c`:
//! allocates its only buffer with `calloc`, with fault injection enabled
//! around that one call. Pair with `sample-stub-calloc`.

const MYSTRING: &str = "This is my string";

fn main() {
    covex_stub::set_enabled(true);

    // SAFETY: the returned pointer is null-checked before use.
    let mem = unsafe { libc::calloc(1, MYSTRING.len() + 1) };

    covex_stub::set_enabled(false);

    if mem.is_null() {
        eprintln!("calloc: {}", std::io::Error::last_os_error());
        std::process::exit(1);
    }

    // SAFETY: `mem` was just allocated by calloc and is non-null.
    unsafe { libc::free(mem) };
    std::process::exit(0);
}
