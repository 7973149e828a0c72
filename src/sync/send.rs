use thiserror::Error;

/// Progress of one user-initiated send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Composing,
    AwaitingJoin,
    AwaitingAck,
    Confirmed,
    Failed,
}

impl SendPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal send transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SendPhase,
    pub to: SendPhase,
}

/// `Composing -> AwaitingJoin -> AwaitingAck -> Confirmed`, with `Failed`
/// reachable from any non-terminal phase. A manual resend starts a new
/// machine rather than reviving a failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendMachine {
    phase: SendPhase,
}

impl Default for SendMachine {
    fn default() -> Self {
        Self {
            phase: SendPhase::Composing,
        }
    }
}

impl SendMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SendPhase {
        self.phase
    }

    pub fn advance(&mut self, to: SendPhase) -> Result<(), InvalidTransition> {
        use SendPhase::*;

        let allowed = matches!(
            (self.phase, to),
            (Composing, AwaitingJoin)
                | (AwaitingJoin, AwaitingAck)
                | (AwaitingAck, Confirmed)
                | (Composing | AwaitingJoin | AwaitingAck, Failed)
        );
        if !allowed {
            return Err(InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }
}
