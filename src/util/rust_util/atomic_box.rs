use std::sync::atomic::{AtomicPtr, Ordering};

/// A lazily published box.  Similar to an `Option<Box<T>>`, but can be initialized atomically,
/// and only once.
///
/// Publication uses a release CAS and `get` an acquire load, so a reader that observes the
/// pointer also observes every write made to the value before it was published. This is what
/// lets vtables and interface layouts be read without a lock.
pub struct OnceOptionBox<T> {
    inner: AtomicPtr<T>,
}

unsafe impl<T: Send + Sync> Send for OnceOptionBox<T> {}
unsafe impl<T: Send + Sync> Sync for OnceOptionBox<T> {}

impl<T> OnceOptionBox<T> {
    pub const fn new() -> OnceOptionBox<T> {
        Self {
            inner: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn get(&self) -> Option<&T> {
        let ptr = self.inner.load(Ordering::Acquire);
        unsafe { ptr.as_ref() }
    }

    pub fn is_published(&self) -> bool {
        !self.inner.load(Ordering::Acquire).is_null()
    }

    /// Publish `value`. If another value has already been published, `value` is handed back
    /// in the `Err` variant and the published value stays as it is.
    pub fn publish(&self, value: T) -> Result<&T, T> {
        let new_inner = Box::into_raw(Box::new(value));
        match self.inner.compare_exchange(
            std::ptr::null_mut(),
            new_inner,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(old_inner) => {
                debug_assert_eq!(old_inner, std::ptr::null_mut());
                Ok(unsafe { &*new_inner })
            }
            Err(_) => Err(*unsafe { Box::from_raw(new_inner) }),
        }
    }

    /// Publish `value` unless something is already published, and return whichever value won.
    pub fn publish_or_get(&self, value: T) -> &T {
        match self.publish(value) {
            Ok(published) => published,
            Err(_) => self
                .get()
                .unwrap_or_else(|| unreachable!("publish failed with nothing published")),
        }
    }

    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(get_result) = self.get() {
            return get_result;
        }
        self.publish_or_get(init())
    }
}

impl<T> Default for OnceOptionBox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for OnceOptionBox<T> {
    fn drop(&mut self) {
        let ptr = *self.inner.get_mut();
        if !ptr.is_null() {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for OnceOptionBox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OnceOptionBox").field(&self.get()).finish()
    }
}
