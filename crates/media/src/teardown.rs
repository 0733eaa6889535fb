//! Ordered shutdown of codec sessions.

use std::time::Duration;

use crate::codec::CodecLifecycle;

/// Shut a codec session down.
///
/// Hardware sessions are stopped first, given `delay` to retire device
/// work, and only then released. Freeing a hardware session before it is
/// stopped can hang or crash the driver.
pub fn retire_codec<C: CodecLifecycle + ?Sized>(codec: &mut C, delay: Duration) {
    if codec.is_hardware() {
        codec.stop();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
    codec.release();
}
