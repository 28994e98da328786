//! Small shared helpers.

use std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    sync::{Mutex, MutexGuard, Once, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static BACKTRACE_HOOK: Once = Once::new();

/// Lock a mutex, ignoring poisoning.
///
/// Panics are recovered at several boundaries (handlers, listeners, the
/// background job), so a poisoned lock only means a recovered panic happened
/// while it was held. The protected data stays consistent because every
/// critical section here is a plain field update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Chain a panic hook that records a backtrace on the panicking thread.
///
/// Installed once per process; the previous hook still runs.
pub(crate) fn record_panic_backtraces() {
    BACKTRACE_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            PANIC_BACKTRACE.with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    *slot = Some(Backtrace::force_capture());
                }
            });
            previous(info);
        }));
    });
}

/// Backtrace of the last panic on this thread, if one was recorded.
///
/// `catch_unwind` returns on the thread that panicked, so calling this right
/// after a caught panic yields that panic's trace.
pub(crate) fn take_panic_backtrace() -> Option<Backtrace> {
    PANIC_BACKTRACE.with(|slot| slot.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_reads_str_and_string() {
        let payload = std::panic::catch_unwind(|| -> u8 { std::panic::panic_any("static") }).unwrap_err();
        assert_eq!(panic_message(&*payload), "static");

        let payload =
            std::panic::catch_unwind(|| -> u8 { std::panic::panic_any(String::from("owned")) })
                .unwrap_err();
        assert_eq!(panic_message(&*payload), "owned");

        let payload = std::panic::catch_unwind(|| -> u8 { std::panic::panic_any(42u32) }).unwrap_err();
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }

    #[test]
    fn poisoned_mutex_is_still_usable() {
        let mutex = Mutex::new(1);
        let _ = std::panic::catch_unwind(|| -> u8 {
            let _guard = mutex.lock().unwrap();
            std::panic::panic_any("poison")
        });

        assert!(mutex.is_poisoned());
        *lock(&mutex) += 1;
        assert_eq!(*lock(&mutex), 2);
    }

    #[test]
    fn caught_panic_leaves_a_backtrace() {
        record_panic_backtraces();
        let _ = take_panic_backtrace();

        let caught = std::panic::catch_unwind(|| -> u8 { std::panic::panic_any("traced") });

        assert!(caught.is_err());
        assert!(take_panic_backtrace().is_some());
        assert!(take_panic_backtrace().is_none());
    }
}
