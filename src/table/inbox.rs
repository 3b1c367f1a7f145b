use std::collections::VecDeque;

use hashbrown::HashMap;
use tokio::sync::mpsc;
use tracing::trace;

use super::wire::Frame;

/// Frames delivered to one endpoint, sorted out by round.
///
/// Members run rounds in lockstep but not in sync: a fast peer may already
/// publish for the next round while this member is still reading the current
/// one. Those frames are held back until their round's table asks for them.
/// Frames for rounds that already finished are dropped.
pub(crate) struct Inbox {
    rx: mpsc::UnboundedReceiver<Frame>,
    stash: HashMap<u64, VecDeque<Frame>>,
}

impl Inbox {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            rx,
            stash: HashMap::new(),
        }
    }

    /// Forgets everything held back for rounds before `round`.
    pub(crate) fn start_round(&mut self, round: u64) {
        self.stash.retain(|r, _| *r >= round);
    }

    /// Next frame for `round`. Cancel safe.
    pub(crate) async fn next_for(&mut self, round: u64) -> Option<Frame> {
        if let Some(frame) = self.stashed(round) {
            return Some(frame);
        }
        loop {
            let frame = self.rx.recv().await?;
            if let Some(frame) = self.sort(frame, round) {
                return Some(frame);
            }
        }
    }

    /// Next frame for `round` that has already been delivered, without
    /// waiting for more.
    pub(crate) fn try_next_for(&mut self, round: u64) -> Option<Frame> {
        if let Some(frame) = self.stashed(round) {
            return Some(frame);
        }
        while let Ok(frame) = self.rx.try_recv() {
            if let Some(frame) = self.sort(frame, round) {
                return Some(frame);
            }
        }
        None
    }

    fn stashed(&mut self, round: u64) -> Option<Frame> {
        self.stash.get_mut(&round)?.pop_front()
    }

    /// Hands back `frame` if it belongs to `round`, holds it if it belongs to
    /// a later one.
    fn sort(&mut self, frame: Frame, round: u64) -> Option<Frame> {
        if frame.round == round {
            return Some(frame);
        }
        if frame.round > round {
            trace!(
                "holding frame from member {} for round {}",
                frame.from,
                frame.round
            );
            self.stash.entry(frame.round).or_default().push_back(frame);
        } else {
            trace!(
                "dropping frame from member {} of finished round {}",
                frame.from,
                frame.round
            );
        }
        None
    }
}
