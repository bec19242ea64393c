//! Agent session records.
//!
//! Registering a session and starting it are separate steps. A session is
//! started at most once: the first start with an instruction launches the
//! worker, later starts with the same instruction are acknowledged, and a start
//! with a different instruction is refused.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Registered,
    Running { instruction: String },
    Exited { instruction: String },
}

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub label: String,
    pub state: SessionState,
}

/// What a start request should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    Launch,
    AlreadyStarted,
    Conflict,
}

impl SessionEntry {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: SessionState::Registered,
        }
    }

    pub fn decide_start(&self, instruction: &str) -> StartDecision {
        match &self.state {
            SessionState::Registered => StartDecision::Launch,
            SessionState::Running { instruction: started }
            | SessionState::Exited { instruction: started } => {
                if started == instruction {
                    StartDecision::AlreadyStarted
                } else {
                    StartDecision::Conflict
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SessionState::Running { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_decisions() {
        let mut session = SessionEntry::new("fix bug X");
        assert_eq!(session.decide_start("fix bug X"), StartDecision::Launch);

        session.state = SessionState::Running {
            instruction: "fix bug X".into(),
        };
        assert!(session.is_running());
        assert_eq!(session.decide_start("fix bug X"), StartDecision::AlreadyStarted);
        assert_eq!(session.decide_start("fix bug Y"), StartDecision::Conflict);

        session.state = SessionState::Exited {
            instruction: "fix bug X".into(),
        };
        assert_eq!(session.decide_start("fix bug X"), StartDecision::AlreadyStarted);
        assert_eq!(session.decide_start("fix bug Y"), StartDecision::Conflict);
    }
}
