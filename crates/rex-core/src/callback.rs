//! Invocation of user-supplied callbacks.
//!
//! Escape-sequence actions and signal handlers are arbitrary user code that
//! runs on a thread the library owns. A panic inside one is caught here and
//! logged instead of unwinding through the byte stream or dispatch loop.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::error;

/// Run `f`, logging (and swallowing) any panic it raises.
///
/// Returns `true` if `f` completed normally.
pub fn invoke_guarded<F: FnOnce()>(what: &str, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            error!(callback = what, "panic in callback: {}", panic_message(&payload));
            false
        }
    }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod test_log {
    //! Captures `tracing` output for assertions.

    use std::io;
    use std::sync::Arc;

    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` with a subscriber that writes into the returned buffer.
    pub fn capture<R>(f: impl FnOnce() -> R) -> (R, LogBuffer) {
        let buf = LogBuffer::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let out = tracing::subscriber::with_default(subscriber, f);
        (out, buf)
    }
}
