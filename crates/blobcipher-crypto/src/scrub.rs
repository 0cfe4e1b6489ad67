//! Secret scrubbing on abnormal termination.
//!
//! Key material must not survive into a core dump. The hosting process
//! registers the cache here: a panic hook scrubs it before the default hook
//! (and any abort) runs, and a [`ScrubGuard`] scrubs it on scope exit.

use std::sync::Arc;

use crate::cache::CipherKeyCache;

/// Chain a panic hook that calls [`CipherKeyCache::try_cleanup_all`] before
/// the previously installed hook.
///
/// The panicking thread may hold cache or key locks, so the hook never blocks
/// on them; whatever it cannot lock is left for [`ScrubGuard`] or drop.
pub fn install_panic_scrubber(cache: Arc<CipherKeyCache>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        cache.try_cleanup_all();
        previous(info);
    }));
}

/// Scrubs the cache when dropped.
pub struct ScrubGuard {
    cache: Arc<CipherKeyCache>,
}

impl ScrubGuard {
    pub fn new(cache: Arc<CipherKeyCache>) -> Self {
        Self { cache }
    }
}

impl Drop for ScrubGuard {
    fn drop(&mut self) {
        self.cache.cleanup_all();
    }
}
