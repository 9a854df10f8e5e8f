//! Open-stream accounting for an HTTP/2 connection: the connection only
//! closes once every stream in flight when shutdown began has drained.

use tracing::debug;

/// Stream-lifecycle and idle events the connection loop feeds in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackerEvent {
    StreamCreated,
    StreamClosed,

    /// Soft shutdown: stop taking new streams, close once drained.
    Quiesce,

    /// Nothing read for the configured window.
    IdleRead,

    /// Nothing written for the configured window.
    IdleWrite,
}

/// What the connection loop should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackerVerdict {
    Continue,
    Close,
}

/// `Closing` is terminal; reaching it a second way is a no-op, which is
/// what makes close idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackerState {
    Active { open: u32 },
    Quiescing { open: u32 },
    Closing,
}

pub(crate) struct StreamTracker {
    state: TrackerState,
}

impl StreamTracker {
    pub(crate) fn new() -> Self {
        Self {
            state: TrackerState::Active { open: 0 },
        }
    }

    pub(crate) fn state(&self) -> TrackerState {
        self.state
    }

    pub(crate) fn open_streams(&self) -> u32 {
        match self.state {
            TrackerState::Active { open } | TrackerState::Quiescing { open } => open,
            TrackerState::Closing => 0,
        }
    }

    pub(crate) fn is_quiescing(&self) -> bool {
        matches!(self.state, TrackerState::Quiescing { .. })
    }

    pub(crate) fn on_event(&mut self, event: TrackerEvent) -> TrackerVerdict {
        use TrackerEvent::*;
        use TrackerState::*;

        let (next, verdict) = match (self.state, event) {
            (Closing, _) => (Closing, TrackerVerdict::Close),

            (Active { open }, StreamCreated) => {
                (Active { open: open + 1 }, TrackerVerdict::Continue)
            }
            // new streams are refused while quiescing; the count is
            // whatever was in flight when shutdown began
            (Quiescing { open }, StreamCreated) => {
                debug!("refusing stream created while quiescing");
                (Quiescing { open }, TrackerVerdict::Continue)
            }

            (Active { open }, StreamClosed) => (
                Active {
                    open: open.saturating_sub(1),
                },
                TrackerVerdict::Continue,
            ),
            (Quiescing { open }, StreamClosed) => {
                let open = open.saturating_sub(1);
                if open == 0 {
                    (Closing, TrackerVerdict::Close)
                } else {
                    (Quiescing { open }, TrackerVerdict::Continue)
                }
            }

            (Active { open: 0 }, Quiesce) => (Closing, TrackerVerdict::Close),
            (Active { open }, Quiesce) => (Quiescing { open }, TrackerVerdict::Continue),
            (Quiescing { open }, Quiesce) => (Quiescing { open }, TrackerVerdict::Continue),

            // the peer went idle mid-request: there is no point waiting
            (Active { open }, IdleRead) | (Quiescing { open }, IdleRead) => {
                if open > 0 {
                    (Closing, TrackerVerdict::Close)
                } else {
                    (self.state, TrackerVerdict::Continue)
                }
            }

            // a long-idle keep-alive connection; only reap it between
            // streams
            (Active { open }, IdleWrite) | (Quiescing { open }, IdleWrite) => {
                if open == 0 {
                    (Closing, TrackerVerdict::Close)
                } else {
                    (self.state, TrackerVerdict::Continue)
                }
            }
        };

        self.state = next;
        verdict
    }
}
