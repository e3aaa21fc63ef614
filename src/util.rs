use core::ops::{Deref, DerefMut};

/// Logs to `tracing` in test builds; compiles to nothing otherwise.
macro_rules! test_trace {
    ($($arg:tt)+) => {
        #[cfg(test)]
        tracing::trace!($($arg)+)
    };
}

/// Aligns a value to the size of a cache line.
///
/// The queue wraps each side's contended words in this so that the
/// producer's stores and the consumer's stores land on different lines
/// instead of false-sharing one. On x86_64 and aarch64 the alignment is 128
/// bytes, since those targets prefetch cache lines in adjacent pairs; other
/// targets get 64 bytes. The `no-cache-pad` feature reduces this to a plain
/// newtype, for targets that have no data cache to ping-pong in the first
/// place.
#[cfg_attr(
    all(
        not(feature = "no-cache-pad"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ),
    repr(align(128))
)]
#[cfg_attr(
    all(
        not(feature = "no-cache-pad"),
        not(any(target_arch = "x86_64", target_arch = "aarch64"))
    ),
    repr(align(64))
)]
pub(crate) struct CachePadded<T>(pub(crate) T);

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

#[cfg(test)]
pub(crate) fn assert_send_sync<T: Send + Sync>() {}

#[cfg(test)]
pub(crate) fn assert_send<T: Send>() {}
