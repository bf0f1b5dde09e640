use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

// --- Session State ---
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Recording,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "OFF"),
            SessionState::Recording => write!(f, "ON"),
        }
    }
}

/// Per-session run flag shared with the GPS logging thread.
/// Written by the controller, polled by the thread once per loop iteration.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn raised() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn lower(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state() {
        assert_eq!(SessionState::default(), SessionState::Idle);
    }

    #[test]
    fn test_display_is_on_off() {
        assert_eq!(SessionState::Idle.to_string(), "OFF");
        assert_eq!(SessionState::Recording.to_string(), "ON");
    }

    #[test]
    fn test_run_flag_is_shared() {
        let flag = RunFlag::raised();
        let seen_by_thread = flag.clone();
        assert!(seen_by_thread.is_raised());
        flag.lower();
        assert!(!seen_by_thread.is_raised());
    }
}
