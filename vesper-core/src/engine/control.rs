//! Blocking control loop.
//!
//! ## Per iteration
//!
//! ```text
//! 1. Hand every queued inbound transport frame to the conversation
//! 2. Capture one frame (back off briefly on underrun)
//! 3. Optional noise suppression
//! 4. conversation.process_frame
//! 5. conversation.tick (timers, drain polling), every iteration
//! 6. Yield
//! ```
//!
//! Runs inside `spawn_blocking`; it never blocks on audio output, which is
//! the drain thread's job.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{info, warn};

use crate::{
    audio::{AudioInput, NoiseSuppressor},
    clock::Clock,
    conversation::Conversation,
    error::VesperError,
    protocol::InboundFrame,
};

#[derive(Default)]
pub struct ControlDiagnostics {
    pub frames_captured: AtomicUsize,
    pub capture_misses: AtomicUsize,
    pub inbound_handled: AtomicUsize,
}

impl ControlDiagnostics {
    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.capture_misses.store(0, Ordering::Relaxed);
        self.inbound_handled.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ControlDiagnosticsSnapshot {
        ControlDiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            capture_misses: self.capture_misses.load(Ordering::Relaxed),
            inbound_handled: self.inbound_handled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlDiagnosticsSnapshot {
    pub frames_captured: usize,
    pub capture_misses: usize,
    pub inbound_handled: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ControlPacing {
    /// Back-off after a failed capture. Default: 10 ms.
    pub underrun_backoff: Duration,
    /// Yield at the end of every iteration. Default: 1 ms.
    pub loop_yield: Duration,
}

impl Default for ControlPacing {
    fn default() -> Self {
        Self {
            underrun_backoff: Duration::from_millis(10),
            loop_yield: Duration::from_millis(1),
        }
    }
}

/// All context the control loop needs, passed as one struct so the closure stays tidy.
pub struct ControlContext {
    pub conversation: Conversation,
    pub input: Box<dyn AudioInput>,
    pub inbound: Receiver<InboundFrame>,
    pub suppressor: Option<Box<dyn NoiseSuppressor>>,
    pub running: Arc<AtomicBool>,
    pub clock: Arc<dyn Clock>,
    pub pacing: ControlPacing,
    pub diagnostics: Arc<ControlDiagnostics>,
}

/// Noise suppression with a lazily reserved output buffer. Any problem turns
/// it off for the rest of the run and raw frames pass through.
struct Suppression {
    suppressor: Option<Box<dyn NoiseSuppressor>>,
    out: Vec<i16>,
}

impl Suppression {
    fn new(suppressor: Option<Box<dyn NoiseSuppressor>>) -> Self {
        Self {
            suppressor,
            out: Vec::new(),
        }
    }

    fn apply<'a>(&'a mut self, frame: &'a [i16]) -> &'a [i16] {
        let Some(ns) = self.suppressor.as_mut() else {
            return frame;
        };
        if ns.frame_len() != frame.len() {
            warn!(
                expected = ns.frame_len(),
                got = frame.len(),
                "noise suppressor frame size mismatch, disabling"
            );
            self.suppressor = None;
            return frame;
        }
        if self.out.len() != frame.len() {
            if self.out.try_reserve_exact(frame.len()).is_err() {
                warn!("noise suppression buffer unavailable, disabling");
                self.suppressor = None;
                return frame;
            }
            self.out.resize(frame.len(), 0);
        }
        ns.process(frame, &mut self.out);
        &self.out
    }
}

/// Run until `ctx.running` becomes false, then hand the conversation back.
pub fn run(ctx: ControlContext) -> Conversation {
    let ControlContext {
        mut conversation,
        mut input,
        inbound,
        suppressor,
        running,
        clock,
        pacing,
        diagnostics,
    } = ctx;

    let frame_len = conversation.frame_len();
    let mut frame = vec![0i16; frame_len];
    let mut suppression = Suppression::new(suppressor);
    info!(frame_len, "control loop started");

    while running.load(Ordering::Relaxed) {
        for message in inbound.try_iter() {
            diagnostics.inbound_handled.fetch_add(1, Ordering::Relaxed);
            conversation.handle_inbound(message);
        }

        match input.capture_frame(&mut frame) {
            Ok(()) => {
                diagnostics.frames_captured.fetch_add(1, Ordering::Relaxed);
                let processed = suppression.apply(&frame);
                conversation.process_frame(processed);
            }
            Err(VesperError::CaptureUnderrun) => {
                diagnostics.capture_misses.fetch_add(1, Ordering::Relaxed);
                clock.sleep(pacing.underrun_backoff);
            }
            Err(e) => {
                diagnostics.capture_misses.fetch_add(1, Ordering::Relaxed);
                warn!("capture failed: {e}");
                clock.sleep(pacing.underrun_backoff);
            }
        }

        conversation.tick();
        clock.sleep(pacing.loop_yield);
    }

    info!(
        frames = diagnostics.frames_captured.load(Ordering::Relaxed),
        "control loop stopped"
    );
    conversation
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Halver;

    impl NoiseSuppressor for Halver {
        fn frame_len(&self) -> usize {
            4
        }
        fn process(&mut self, input: &[i16], output: &mut [i16]) {
            for (o, i) in output.iter_mut().zip(input) {
                *o = i / 2;
            }
        }
    }

    #[test]
    fn suppression_rewrites_frames() {
        let mut s = Suppression::new(Some(Box::new(Halver)));
        let frame = [10i16, 20, 30, 40];
        assert_eq!(s.apply(&frame), &[5, 10, 15, 20]);
    }

    #[test]
    fn mismatched_suppressor_is_disabled_and_raw_frames_pass() {
        let mut s = Suppression::new(Some(Box::new(Halver)));
        let frame = [10i16; 6];
        assert_eq!(s.apply(&frame), &frame);
        assert!(s.suppressor.is_none());
    }

    #[test]
    fn no_suppressor_is_passthrough() {
        let mut s = Suppression::new(None);
        let frame = [7i16; 3];
        assert_eq!(s.apply(&frame), &frame);
    }

    #[test]
    fn diagnostics_reset_to_zero() {
        let d = ControlDiagnostics::default();
        d.frames_captured.fetch_add(3, Ordering::Relaxed);
        d.capture_misses.fetch_add(1, Ordering::Relaxed);
        d.reset();
        assert_eq!(d.snapshot(), ControlDiagnosticsSnapshot::default());
    }
}
