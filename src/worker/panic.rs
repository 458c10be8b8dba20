//! Catch-and-convert boundary for procedure calls and request handlers.
//!
//! A process-wide panic hook stashes a backtrace in a thread-local right
//! where the panic happens; [`catch_panic`] picks it up on the same poll.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use futures::FutureExt;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Chain a backtrace-capturing hook in front of the existing one.
pub fn install_backtrace_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

#[derive(Debug, Clone)]
pub struct CaughtPanic {
    pub message: String,
    pub backtrace: String,
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Poll `fut` to completion, turning a panic into [`CaughtPanic`].
pub async fn catch_panic<F: Future>(fut: F) -> Result<F::Output, CaughtPanic> {
    install_backtrace_hook();
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(output) => Ok(output),
        Err(payload) => {
            let backtrace = LAST_BACKTRACE
                .with(|slot| slot.borrow_mut().take())
                .unwrap_or_else(|| "backtrace unavailable".to_string());
            Err(CaughtPanic {
                message: panic_message(payload.as_ref()),
                backtrace,
            })
        }
    }
}
