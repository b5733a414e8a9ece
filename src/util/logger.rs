use log::SetLoggerError;

/// Attempt to init a env_logger for the runtime.
/// Does nothing if the "builtin_env_logger" feature is disabled.
///
/// The filter is read from `RUST_LOG`. A binding that already installed its own logger can call
/// this anyway; the error is returned and can be ignored.
pub fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            env_logger::try_init_from_env(
                // By default, use info level logging.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            )
        } else {
            Ok(())
        }
    }
}
