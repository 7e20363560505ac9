//! # Wake Actions
//!
//! What actually happens when the alarm goes off. The core only knows the
//! [`WakeAction`] hook; lights, music and volume ramps live behind it.
//!
//! Two actions ship with the crate:
//! - [`LogWakeAction`]: just logs, useful in development and `--simulate` mode
//! - [`CommandWakeAction`]: runs a configured command, e.g. a script that turns
//!   on the bedroom light and starts a radio stream

use log::{debug, error, info, warn};
use std::process::Command;
use thiserror::Error;

/// Hook invoked once per alarm firing, with no arguments.
///
/// Runs on the blocking thread pool; it may take as long as it needs.
pub trait WakeAction: Send + Sync + 'static {
    fn wake(&self);
}

impl<F> WakeAction for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn wake(&self) {
        self()
    }
}

/// Wake action that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogWakeAction;

impl WakeAction for LogWakeAction {
    fn wake(&self) {
        info!("Wake-up! (no wake command configured)");
    }
}

/// Errors building a [`CommandWakeAction`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WakeError {
    #[error("wake command is empty")]
    EmptyCommand,
}

/// Runs an external program and waits for it to finish.
#[derive(Debug, Clone)]
pub struct CommandWakeAction {
    program: String,
    args: Vec<String>,
}

impl CommandWakeAction {
    /// Build from an argv-style list: program followed by its arguments.
    pub fn from_argv(argv: &[String]) -> Result<Self, WakeError> {
        let (program, args) = argv.split_first().ok_or(WakeError::EmptyCommand)?;
        if program.trim().is_empty() {
            return Err(WakeError::EmptyCommand);
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl WakeAction for CommandWakeAction {
    fn wake(&self) {
        debug!("Running wake command: {} {:?}", self.program, self.args);
        match Command::new(&self.program).args(&self.args).status() {
            Ok(status) if status.success() => debug!("Wake command finished"),
            Ok(status) => warn!("Wake command exited with {}", status),
            Err(e) => error!("Wake command {} failed to start: {}", self.program, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_from_argv() {
        let argv = vec!["mosquitto_pub".to_string(), "-t".to_string(), "light".to_string()];
        let action = CommandWakeAction::from_argv(&argv).unwrap();
        assert_eq!(action.program(), "mosquitto_pub");
        assert_eq!(action.args, vec!["-t", "light"]);
    }

    #[test]
    fn test_empty_command_rejected() {
        assert_eq!(
            CommandWakeAction::from_argv(&[]).unwrap_err(),
            WakeError::EmptyCommand
        );
        assert_eq!(
            CommandWakeAction::from_argv(&["  ".to_string()]).unwrap_err(),
            WakeError::EmptyCommand
        );
    }

    #[test]
    fn test_closure_is_a_wake_action() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let action: Box<dyn WakeAction> = Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        action.wake();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_program_does_not_panic() {
        let action =
            CommandWakeAction::from_argv(&["/nonexistent/wake-script".to_string()]).unwrap();
        action.wake();
    }
}
