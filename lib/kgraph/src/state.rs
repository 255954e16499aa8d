use std::fmt;

/// The two sub-phases of a superstep. A superstep runs SEND (compute and
/// emit) first, then RECEIVE (drain and deliver).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Created,
    Running,
    Completed,
}

/// Global BSP position of a worker. Starts at `(-1, RECEIVE, CREATED)`;
/// `next()` toggles the stage and increments the superstep on the
/// RECEIVE -> SEND wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PregelState {
    superstep: i32,
    stage: Stage,
    status: Status,
}

impl PregelState {
    pub const fn initial() -> Self {
        PregelState { superstep: -1, stage: Stage::Receive, status: Status::Created }
    }

    pub fn superstep(&self) -> i32 {
        self.superstep
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn running(self) -> Self {
        self.with_status(Status::Running)
    }

    pub fn with_status(self, status: Status) -> Self {
        PregelState { status, ..self }
    }

    pub fn next(self) -> Self {
        match self.stage {
            Stage::Receive => {
                PregelState { superstep: self.superstep + 1, stage: Stage::Send, status: self.status }
            }
            Stage::Send => PregelState { stage: Stage::Receive, ..self },
        }
    }

    /// Barrier directory prefix for this stage.
    pub fn phase_name(&self) -> &'static str {
        match self.stage {
            Stage::Send => "snd",
            Stage::Receive => "rcv",
        }
    }

    /// Position in the global phase order, for monotonicity checks. SEND of a
    /// superstep precedes its RECEIVE.
    pub fn ordinal(&self) -> (i32, u8) {
        let stage = match self.stage {
            Stage::Send => 0,
            Stage::Receive => 1,
        };
        (self.superstep, stage)
    }
}

impl fmt::Display for PregelState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{} ({:?})", self.phase_name(), self.superstep, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_toggles_stage_and_increments_on_wrap() {
        let s0 = PregelState::initial();
        assert_eq!((s0.superstep(), s0.stage()), (-1, Stage::Receive));

        let s1 = s0.next();
        assert_eq!((s1.superstep(), s1.stage()), (0, Stage::Send));

        let s2 = s1.next();
        assert_eq!((s2.superstep(), s2.stage()), (0, Stage::Receive));

        let s3 = s2.next();
        assert_eq!((s3.superstep(), s3.stage()), (1, Stage::Send));
    }

    #[test]
    fn ordinal_orders_phases() {
        let mut state = PregelState::initial();
        let mut last = state.ordinal();
        for _ in 0..6 {
            state = state.next();
            assert!(state.ordinal() > last);
            last = state.ordinal();
        }
    }

    #[test]
    fn status_does_not_affect_position() {
        let state = PregelState::initial().next();
        assert_eq!(state.ordinal(), state.with_status(Status::Completed).ordinal());
    }
}
