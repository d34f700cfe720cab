// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use calloop::{
    ping::{make_ping, Ping},
    timer::{TimeoutAction, Timer},
    LoopHandle, RegistrationToken,
};
use smithay::utils::{Clock, Monotonic};
use tracing::{trace, warn};

use crate::utils::signal::{ListenerId, Signal};

pub const DEFAULT_REFRESH: i32 = 60_000;

/// Interval between frames for a refresh rate in mHz.
pub fn refresh_interval(refresh: i32) -> Duration {
    let refresh = if refresh > 0 { refresh } else { DEFAULT_REFRESH };
    Duration::from_micros(1_000_000_000 / refresh as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStrategy {
    /// No completion events, frames are paced by a countdown of one refresh interval.
    Timer,
    /// The presentation mechanism reports when a frame is done.
    Completion,
}

/// Raised when the output is ready for a new frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameNeeded {
    /// Presentation sequence that completed, if any.
    pub sequence: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum QueueState {
    #[default]
    Idle,
    /// A frame signal is raised on the next dispatch.
    Queued,
    /// A frame was submitted and we are waiting for it to be done.
    WaitingForFrame {
        deadline: Option<Duration>,
        redraw_needed: bool,
    },
}

struct SchedulerInner {
    name: String,
    strategy: FrameStrategy,
    interval: Duration,
    state: QueueState,
    last_sequence: Option<u64>,
    ping: Option<Ping>,
    frame: Signal<FrameNeeded>,
}

impl SchedulerInner {
    fn wake(&self) {
        if let Some(ping) = &self.ping {
            ping.ping();
        }
    }
}

/// Decides when an output should draw its next frame.
///
/// All methods take the current monotonic time explicitly; the event loop
/// glue from [`FrameScheduler::insert_into_loop`] drives [`FrameScheduler::dispatch`].
#[derive(Clone)]
pub struct FrameScheduler(Rc<RefCell<SchedulerInner>>);

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("FrameScheduler")
            .field("name", &inner.name)
            .field("strategy", &inner.strategy)
            .field("state", &inner.state)
            .finish()
    }
}

impl FrameScheduler {
    pub fn new(name: &str, strategy: FrameStrategy, refresh: i32) -> FrameScheduler {
        FrameScheduler(Rc::new(RefCell::new(SchedulerInner {
            name: name.to_string(),
            strategy,
            interval: refresh_interval(refresh),
            state: QueueState::Idle,
            last_sequence: None,
            ping: None,
            frame: Signal::new(),
        })))
    }

    pub fn strategy(&self) -> FrameStrategy {
        self.0.borrow().strategy
    }

    pub fn refresh_interval(&self) -> Duration {
        self.0.borrow().interval
    }

    pub fn set_refresh(&self, refresh: i32) {
        self.0.borrow_mut().interval = refresh_interval(refresh);
    }

    pub fn connect_frame(&self, listener: impl FnMut(&FrameNeeded) + 'static) -> ListenerId {
        self.0.borrow().frame.connect(listener)
    }

    pub fn disconnect_frame(&self, id: ListenerId) {
        self.0.borrow().frame.disconnect(id);
    }

    /// Whether a frame signal is pending or waiting on a submitted frame.
    pub fn is_scheduled(&self) -> bool {
        match self.0.borrow().state {
            QueueState::Idle => false,
            QueueState::Queued => true,
            QueueState::WaitingForFrame { redraw_needed, .. } => redraw_needed,
        }
    }

    /// Requests a frame signal. Repeated requests before it is raised coalesce.
    pub fn schedule_frame(&self) {
        let mut inner = self.0.borrow_mut();
        match inner.state {
            QueueState::Idle => {
                trace!(output = %inner.name, "Frame queued");
                inner.state = QueueState::Queued;
                inner.wake();
            }
            QueueState::Queued => {}
            QueueState::WaitingForFrame { deadline, .. } => {
                inner.state = QueueState::WaitingForFrame {
                    deadline,
                    redraw_needed: true,
                };
            }
        }
    }

    pub fn frame_submitted(&self, now: Duration) {
        let mut inner = self.0.borrow_mut();
        let deadline = match inner.strategy {
            FrameStrategy::Timer => Some(now + inner.interval),
            FrameStrategy::Completion => None,
        };
        let redraw_needed = match inner.state {
            QueueState::Idle => false,
            QueueState::Queued => true,
            QueueState::WaitingForFrame { redraw_needed, .. } => redraw_needed,
        };
        inner.state = QueueState::WaitingForFrame {
            deadline,
            redraw_needed,
        };
        inner.wake();
    }

    /// Retries after one refresh interval, regardless of the strategy.
    pub fn frame_dropped(&self, now: Duration) {
        let mut inner = self.0.borrow_mut();
        inner.state = QueueState::WaitingForFrame {
            deadline: Some(now + inner.interval),
            redraw_needed: true,
        };
        inner.wake();
    }

    /// Handles a completion event. Sequences that do not advance are ignored.
    pub fn on_completion(&self, sequence: Option<u64>) -> bool {
        let signal = {
            let mut inner = self.0.borrow_mut();
            if let Some(sequence) = sequence {
                if inner.last_sequence.is_some_and(|last| sequence <= last) {
                    trace!(output = %inner.name, sequence, "Ignoring stale completion");
                    return false;
                }
                inner.last_sequence = Some(sequence);
            }
            inner.state = QueueState::Idle;
            inner.frame.clone()
        };
        signal.emit(&FrameNeeded { sequence });
        true
    }

    /// Raises the frame signal if it is due. Returns whether it was raised.
    pub fn dispatch(&self, now: Duration) -> bool {
        let signal = {
            let mut inner = self.0.borrow_mut();
            let due = match inner.state {
                QueueState::Idle => false,
                QueueState::Queued => true,
                QueueState::WaitingForFrame { deadline, .. } => {
                    deadline.is_some_and(|deadline| now >= deadline)
                }
            };
            if !due {
                return false;
            }
            inner.state = QueueState::Idle;
            inner.frame.clone()
        };
        signal.emit(&FrameNeeded { sequence: None });
        true
    }

    /// Time until the next [`FrameScheduler::dispatch`] has something to do.
    pub fn next_deadline(&self, now: Duration) -> Option<Duration> {
        match self.0.borrow().state {
            QueueState::Idle => None,
            QueueState::Queued => Some(Duration::ZERO),
            QueueState::WaitingForFrame { deadline, .. } => {
                deadline.map(|deadline| deadline.saturating_sub(now))
            }
        }
    }

    pub fn cancel(&self) {
        let mut inner = self.0.borrow_mut();
        inner.state = QueueState::Idle;
        inner.wake();
    }

    /// Drives the scheduler from a calloop event loop.
    pub fn insert_into_loop<D: 'static>(
        &self,
        handle: &LoopHandle<'static, D>,
    ) -> Result<RegistrationToken> {
        let (ping, source) = make_ping().context("Failed to create frame scheduler ping")?;
        let glue = Rc::new(LoopGlue {
            scheduler: self.clone(),
            handle: handle.clone(),
            clock: Clock::<Monotonic>::new(),
            timer: Cell::new(None),
        });
        let token = handle
            .insert_source(source, move |_, _, _| glue.rearm())
            .map_err(|insert_error| anyhow!("{}", insert_error.error))
            .context("Failed to insert frame scheduler")?;
        self.0.borrow_mut().ping = Some(ping.clone());
        ping.ping();
        Ok(token)
    }
}

struct LoopGlue<D: 'static> {
    scheduler: FrameScheduler,
    handle: LoopHandle<'static, D>,
    clock: Clock<Monotonic>,
    timer: Cell<Option<RegistrationToken>>,
}

impl<D: 'static> LoopGlue<D> {
    fn rearm(self: &Rc<Self>) {
        if let Some(token) = self.timer.take() {
            self.handle.remove(token);
        }

        let now: Duration = self.clock.now().into();
        self.scheduler.dispatch(now);
        let Some(delay) = self.scheduler.next_deadline(now) else {
            return;
        };

        let glue = self.clone();
        match self
            .handle
            .insert_source(Timer::from_duration(delay), move |_, _, _| {
                glue.timer.set(None);
                glue.rearm();
                TimeoutAction::Drop
            }) {
            Ok(token) => self.timer.set(Some(token)),
            Err(err) => warn!(err = ?err.error, "Failed to arm frame timer"),
        }
    }
}
