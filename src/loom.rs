pub(crate) use self::inner::*;


#[cfg(not(all(test, loom)))]
mod inner {
    #![allow(dead_code)]

    pub(crate) mod sync {
        pub use alloc::sync::*;
        pub use core::sync::*;
    }

    /// The slice of [`loom::cell`]'s API this crate uses, backed by
    /// [`core::cell::UnsafeCell`] outside of loom runs.
    ///
    /// Routing every access to a role-owned pointer through `with` or
    /// `with_mut` is what lets loom check that the producer/consumer split
    /// is actually respected; in normal builds both compile down to a bare
    /// pointer access.
    pub(crate) mod cell {
        pub(crate) struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

        impl<T> UnsafeCell<T> {
            pub(crate) const fn new(value: T) -> Self {
                Self(core::cell::UnsafeCell::new(value))
            }

            #[inline(always)]
            pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
                f(self.0.get())
            }

            #[inline(always)]
            pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
                f(self.0.get())
            }
        }
    }
}
