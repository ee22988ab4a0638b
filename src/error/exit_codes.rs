use crate::error::MutexRunError;

/// Exit code used when the lock could not be obtained or no command was given.
pub const EXIT_FAILURE: i32 = 1;

/// Exit code used for configuration and argument problems.
pub const EXIT_USAGE: i32 = 2;

pub fn get_exit_code(error: &MutexRunError) -> i32 {
    match error {
        MutexRunError::InvalidConfig(_)
        | MutexRunError::ConfigError(_)
        | MutexRunError::InvalidDuration(_) => EXIT_USAGE,

        // Lock failures, usage errors without a command, and anything unexpected.
        _ => EXIT_FAILURE,
    }
}
