#![allow(unused_macros)]

/// Helper macro to execute a system call that returns an `io::Result`.
#[cfg(unix)]
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Indicates an API that needs an OS backend which is not available on the
/// current target.
macro_rules! os_required {
    () => {
        panic!("evnet's socket backend is only implemented for Unix targets")
    };
}
