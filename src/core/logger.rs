//! Logger setup for the native library.

#[cfg(target_os = "android")]
use log::LevelFilter;
use std::sync::Once;

static INIT: Once = Once::new();

/// Install the platform logger once per process.
///
/// On Android this routes the `log` facade to logcat. Elsewhere the host
/// application installs its own `log` implementation and this is a no-op.
pub fn init_logger() {
    INIT.call_once(|| {
        #[cfg(target_os = "android")]
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(if cfg!(debug_assertions) { LevelFilter::Debug } else { LevelFilter::Info })
                .with_tag("revscan"),
        );

        log::debug!("revscan logger initialized");
    });
}
