use crate::errors::FeedbotError;
use crate::types::RunState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollVerdict {
    /// New unseen items appeared, or the valve has not tripped yet.
    Continue,
    /// `max_consecutive_empty_scrolls` reached; the feed is exhausted.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFsm {
    pub state: RunState,
    pub consecutive_empty_scrolls: u32,
    pub max_consecutive_empty_scrolls: u32,
    pub total_scrolls: u32,
}

impl RunFsm {
    pub fn new(max_consecutive_empty_scrolls: u32) -> Self {
        Self {
            state: RunState::Initializing,
            consecutive_empty_scrolls: 0,
            max_consecutive_empty_scrolls,
            total_scrolls: 0,
        }
    }

    pub fn transition(&mut self, next: RunState) -> Result<(), FeedbotError> {
        validate_transition(self.state, next)?;
        self.state = next;
        Ok(())
    }

    pub fn terminate(&mut self) {
        self.state = RunState::Terminated;
    }

    pub fn is_terminated(&self) -> bool {
        self.state == RunState::Terminated
    }

    /// Record the outcome of one scroll. The counter only ever grows through
    /// consecutive empty scrolls and resets on the first productive one.
    pub fn on_scroll_completed(&mut self, found_unseen: bool) -> Result<ScrollVerdict, FeedbotError> {
        if self.state != RunState::Scrolling {
            return Err(FeedbotError::InvalidTransition(format!(
                "scroll result applied in {} state",
                self.state.as_str()
            )));
        }
        self.total_scrolls = self.total_scrolls.saturating_add(1);
        if found_unseen {
            self.consecutive_empty_scrolls = 0;
            self.transition(RunState::Traversing)?;
            return Ok(ScrollVerdict::Continue);
        }

        self.consecutive_empty_scrolls = self.consecutive_empty_scrolls.saturating_add(1);
        if self.consecutive_empty_scrolls >= self.max_consecutive_empty_scrolls {
            self.transition(RunState::Terminated)?;
            return Ok(ScrollVerdict::Exhausted);
        }
        self.transition(RunState::Traversing)?;
        Ok(ScrollVerdict::Continue)
    }

    /// Returns `true` when the quota is met and the run has terminated.
    pub fn on_item_processed(&mut self, processed: u32, target: u32) -> Result<bool, FeedbotError> {
        if processed >= target {
            self.transition(RunState::Terminated)?;
            return Ok(true);
        }
        self.transition(RunState::Traversing)?;
        Ok(false)
    }
}

pub fn validate_transition(from: RunState, to: RunState) -> Result<(), FeedbotError> {
    use RunState as S;

    let allowed = match from {
        S::Initializing => matches!(to, S::Traversing | S::Terminated),
        S::Traversing => matches!(to, S::ProcessingItem | S::Scrolling | S::Terminated),
        S::ProcessingItem => matches!(to, S::Traversing | S::Terminated),
        S::Scrolling => matches!(to, S::Traversing | S::Terminated),
        S::Terminated => false,
    };

    if !allowed {
        return Err(FeedbotError::InvalidTransition(format!(
            "{} -> {}",
            from.as_str(),
            to.as_str()
        )));
    }
    Ok(())
}
