//! Operating system signals that control a running session.
//!
//! * Unix: Ctrl-C (SIGINT) and SIGTERM shut down, SIGHUP reloads the
//!   configuration, SIGCONT reports that the process is back in the
//!   foreground.
//! * Other platforms: Ctrl-C only.

use std::fmt;

use crate::error::Result;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Signal received by the process.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ControlSignal {
    /// Interrupt signal (Ctrl-C/SIGINT)
    Interrupt,
    /// Termination signal (SIGTERM)
    Terminate,
    /// Reload configuration signal (SIGHUP)
    Reload,
    /// Continue after a stop (SIGCONT)
    Resume,
}

impl ControlSignal {
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Interrupt | Self::Terminate)
    }
}

/// Listens for [`ControlSignal`]s.
pub struct Handler {
    #[cfg(unix)]
    sigterm: Signal,
    #[cfg(unix)]
    sighup: Signal,
    #[cfg(unix)]
    sigcont: Signal,
}

impl Handler {
    /// Registers the signal handlers.
    ///
    /// # Errors
    ///
    /// Returns error if signal handlers cannot be registered.
    pub fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
                sigcont: signal(SignalKind::from_raw(libc::SIGCONT))?,
            })
        }

        #[cfg(not(unix))]
        Ok(Self {})
    }

    /// Waits for the next signal.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> ControlSignal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => ControlSignal::Interrupt,
                _ = self.sigterm.recv() => ControlSignal::Terminate,
                _ = self.sighup.recv() => ControlSignal::Reload,
                _ = self.sigcont.recv() => ControlSignal::Resume,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            ControlSignal::Interrupt
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlSignal::Interrupt => write!(f, "Ctrl+C"),
            ControlSignal::Terminate => write!(f, "SIGTERM"),
            ControlSignal::Reload => write!(f, "SIGHUP"),
            ControlSignal::Resume => write!(f, "SIGCONT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_interrupt_and_terminate_shut_down() {
        assert!(ControlSignal::Interrupt.is_shutdown());
        assert!(ControlSignal::Terminate.is_shutdown());
        assert!(!ControlSignal::Reload.is_shutdown());
        assert!(!ControlSignal::Resume.is_shutdown());
    }

    #[test]
    fn display_names_the_signal() {
        assert_eq!(ControlSignal::Reload.to_string(), "SIGHUP");
        assert_eq!(ControlSignal::Resume.to_string(), "SIGCONT");
    }
}
