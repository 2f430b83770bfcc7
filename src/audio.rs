//! Audio output session keep-alive.
//!
//! Playback started remotely cannot wait for a user gesture, so the output
//! session must never be torn down while the player idles. The keeper holds
//! an output context open and:
//!
//! * turns every pause into a no-op,
//! * unlocks output on each user interaction, not only the first, as some
//!   platforms suspend the output again after idling,
//! * resumes the context whenever the host becomes visible again.

use std::fmt;

use rodio::{source::Zero, OutputStream, OutputStreamHandle, Sink};

use crate::error::Result;

/// A platform audio output context.
pub trait AudioContext {
    /// Resumes a suspended context.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform refuses to resume.
    fn resume(&mut self) -> Result<()>;

    fn is_suspended(&self) -> bool;

    /// Starts emitting audio, which unlocks output on platforms that require
    /// a first real emission.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing can be played.
    fn emit_silence(&mut self) -> Result<()>;
}

/// Default output device through `rodio`, kept busy with silence.
pub struct RodioContext {
    // Dropping the stream closes the device.
    _stream: OutputStream,
    _handle: OutputStreamHandle,
    sink: Sink,
}

impl RodioContext {
    const CHANNELS: u16 = 2;
    const SAMPLE_RATE: u32 = 44_100;

    /// Opens the default output device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::unavailable`](crate::error::Error::unavailable) if
    /// there is no usable output device.
    pub fn open_default() -> Result<Self> {
        let (stream, handle) = OutputStream::try_default()?;
        let sink = Sink::try_new(&handle)?;
        sink.pause();

        Ok(Self {
            _stream: stream,
            _handle: handle,
            sink,
        })
    }
}

impl AudioContext for RodioContext {
    fn resume(&mut self) -> Result<()> {
        self.sink.play();
        Ok(())
    }

    fn is_suspended(&self) -> bool {
        self.sink.is_paused()
    }

    fn emit_silence(&mut self) -> Result<()> {
        if self.sink.empty() {
            self.sink
                .append(Zero::<f32>::new(Self::CHANNELS, Self::SAMPLE_RATE));
        }
        self.sink.play();
        Ok(())
    }
}

/// Keeps the output session alive across idle and background periods.
pub struct AudioKeeper {
    context: Option<Box<dyn AudioContext>>,
    unlocked: bool,
    visible: bool,
}

impl fmt::Debug for AudioKeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioKeeper")
            .field("context", &self.context.is_some())
            .field("unlocked", &self.unlocked)
            .field("visible", &self.visible)
            .finish()
    }
}

impl Default for AudioKeeper {
    fn default() -> Self {
        Self::disabled()
    }
}

impl AudioKeeper {
    #[must_use]
    pub fn new(context: Box<dyn AudioContext>) -> Self {
        Self {
            context: Some(context),
            unlocked: false,
            visible: true,
        }
    }

    /// A keeper without output, for hosts that render audio elsewhere.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            context: None,
            unlocked: false,
            visible: true,
        }
    }

    /// Opens the default output device, degrading to a disabled keeper when
    /// there is none.
    #[must_use]
    pub fn open_default() -> Self {
        match RodioContext::open_default() {
            Ok(context) => Self::new(Box::new(context)),
            Err(e) => {
                warn!("audio output unavailable, continuing without: {e}");
                Self::disabled()
            }
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.context.is_some()
    }

    /// Whether output was unlocked by an interaction.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Unlocks output. Stays armed: every interaction unlocks again.
    pub fn on_interaction(&mut self) {
        let Some(context) = self.context.as_mut() else {
            return;
        };

        match context.emit_silence() {
            Ok(()) => {
                if !self.unlocked {
                    debug!("audio output unlocked");
                }
                self.unlocked = true;
            }
            Err(e) => warn!("failed to unlock audio output: {e}"),
        }
    }

    /// Tracks host visibility and resumes the context on becoming visible.
    pub fn on_visibility(&mut self, visible: bool) {
        let was_visible = std::mem::replace(&mut self.visible, visible);
        if visible && !was_visible {
            self.resume();
        }
    }

    /// Resumes the context if the platform suspended it.
    pub fn resume(&mut self) {
        let Some(context) = self.context.as_mut() else {
            return;
        };

        if context.is_suspended() {
            match context.resume() {
                Ok(()) => debug!("audio output resumed"),
                Err(e) => warn!("failed to resume audio output: {e}"),
            }
        }
    }

    /// Does nothing. Pausing would release the output session.
    pub fn pause(&mut self) {
        trace!("keeping audio output session alive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::{cell::RefCell, rc::Rc};

    #[derive(Default)]
    struct Calls {
        resumes: usize,
        emissions: usize,
        suspended: bool,
        fail: bool,
    }

    struct FakeContext(Rc<RefCell<Calls>>);

    impl AudioContext for FakeContext {
        fn resume(&mut self) -> Result<()> {
            let mut calls = self.0.borrow_mut();
            calls.resumes += 1;
            calls.suspended = false;
            Ok(())
        }

        fn is_suspended(&self) -> bool {
            self.0.borrow().suspended
        }

        fn emit_silence(&mut self) -> Result<()> {
            let mut calls = self.0.borrow_mut();
            if calls.fail {
                return Err(Error::unavailable("device gone"));
            }
            calls.emissions += 1;
            Ok(())
        }
    }

    fn keeper() -> (Rc<RefCell<Calls>>, AudioKeeper) {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let keeper = AudioKeeper::new(Box::new(FakeContext(Rc::clone(&calls))));
        (calls, keeper)
    }

    #[test]
    fn every_interaction_unlocks() {
        let (calls, mut keeper) = keeper();
        assert!(!keeper.is_unlocked());

        keeper.on_interaction();
        keeper.on_interaction();
        keeper.on_interaction();

        assert!(keeper.is_unlocked());
        assert_eq!(calls.borrow().emissions, 3);
    }

    #[test]
    fn becoming_visible_resumes_suspended_output() {
        let (calls, mut keeper) = keeper();

        keeper.on_visibility(false);
        calls.borrow_mut().suspended = true;
        keeper.on_visibility(true);

        assert_eq!(calls.borrow().resumes, 1);
        assert!(!calls.borrow().suspended);

        // Already visible: nothing to do.
        calls.borrow_mut().suspended = true;
        keeper.on_visibility(true);
        assert_eq!(calls.borrow().resumes, 1);
    }

    #[test]
    fn pause_is_ignored() {
        let (calls, mut keeper) = keeper();
        keeper.on_interaction();

        keeper.pause();

        assert!(keeper.is_unlocked());
        assert!(!calls.borrow().suspended);
    }

    #[test]
    fn failed_unlock_is_not_fatal() {
        let (calls, mut keeper) = keeper();
        calls.borrow_mut().fail = true;

        keeper.on_interaction();

        assert!(!keeper.is_unlocked());
    }

    #[test]
    fn disabled_keeper_does_nothing() {
        let mut keeper = AudioKeeper::disabled();
        keeper.on_interaction();
        keeper.on_visibility(false);
        keeper.on_visibility(true);
        assert!(!keeper.is_enabled());
        assert!(!keeper.is_unlocked());
    }
}
