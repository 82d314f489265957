//! Session state transitions.

use parley_core::types::SessionState;

/// Something that may move the session to a new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The realtime connection is up.
    Opened,
    StartCapture,
    StopCapture,
    /// An audio delta for the current turn was accepted for playback.
    AudioAccepted,
    ResponseDone,
    /// User speech while the assistant is talking.
    Interrupt,
    FunctionCallDone,
    /// The last in-flight function handler settled.
    FunctionsSettled,
    Failure,
    Reset,
    Disconnect,
}

/// Next state for `trigger`, or `None` when the pair is not a transition.
pub fn next(state: SessionState, trigger: Trigger) -> Option<SessionState> {
    use SessionState::*;
    use Trigger as T;

    if state.is_terminal() {
        return None;
    }

    match (state, trigger) {
        (_, T::Disconnect) => Some(Disconnected),
        (Error, T::Failure) => None,
        (_, T::Failure) => Some(Error),
        (Initializing, T::Opened) => Some(Ready),
        (Ready, T::StartCapture) => Some(Recording),
        (Recording, T::StopCapture) => Some(Ready),
        (Ready | Recording, T::AudioAccepted) => Some(AiSpeaking),
        (AiSpeaking, T::ResponseDone) => Some(Ready),
        (AiSpeaking, T::Interrupt) => Some(Ready),
        (ProcessingFunction, T::FunctionCallDone) => None,
        (_, T::FunctionCallDone) => Some(ProcessingFunction),
        (ProcessingFunction, T::FunctionsSettled) => Some(Ready),
        (Error, T::Reset) => Some(Ready),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL_STATES: [SessionState; 7] = [
        Initializing,
        Ready,
        Recording,
        AiSpeaking,
        ProcessingFunction,
        Error,
        Disconnected,
    ];

    #[test]
    fn test_happy_path() {
        let mut state = Initializing;
        for (trigger, expected) in [
            (Trigger::Opened, Ready),
            (Trigger::StartCapture, Recording),
            (Trigger::StopCapture, Ready),
            (Trigger::AudioAccepted, AiSpeaking),
            (Trigger::ResponseDone, Ready),
        ] {
            state = next(state, trigger).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_undefined_pairs_are_no_ops() {
        assert_eq!(next(Initializing, Trigger::StartCapture), None);
        assert_eq!(next(Recording, Trigger::StartCapture), None);
        assert_eq!(next(Ready, Trigger::StopCapture), None);
        assert_eq!(next(Ready, Trigger::Interrupt), None);
        assert_eq!(next(AiSpeaking, Trigger::AudioAccepted), None);
        assert_eq!(next(Ready, Trigger::Reset), None);
        assert_eq!(next(Ready, Trigger::ResponseDone), None);
    }

    #[test]
    fn test_disconnected_is_terminal() {
        for trigger in [
            Trigger::Opened,
            Trigger::StartCapture,
            Trigger::Failure,
            Trigger::Reset,
            Trigger::Disconnect,
            Trigger::FunctionCallDone,
        ] {
            assert_eq!(next(Disconnected, trigger), None);
        }
        for state in ALL_STATES.into_iter().filter(|s| !s.is_terminal()) {
            assert_eq!(next(state, Trigger::Disconnect), Some(Disconnected));
        }
    }

    #[test]
    fn test_function_calls_from_any_live_state() {
        for state in [Initializing, Ready, Recording, AiSpeaking, Error] {
            assert_eq!(next(state, Trigger::FunctionCallDone), Some(ProcessingFunction));
        }
        assert_eq!(next(ProcessingFunction, Trigger::FunctionCallDone), None);
        assert_eq!(next(ProcessingFunction, Trigger::FunctionsSettled), Some(Ready));
        assert_eq!(next(Ready, Trigger::FunctionsSettled), None);
    }

    #[test]
    fn test_failure_and_reset() {
        for state in [Initializing, Ready, Recording, AiSpeaking, ProcessingFunction] {
            assert_eq!(next(state, Trigger::Failure), Some(Error));
        }
        assert_eq!(next(Error, Trigger::Failure), None);
        assert_eq!(next(Error, Trigger::Reset), Some(Ready));
    }

    #[test]
    fn test_interrupt_only_while_speaking() {
        assert_eq!(next(AiSpeaking, Trigger::Interrupt), Some(Ready));
        for state in [Initializing, Ready, Recording, ProcessingFunction, Error] {
            assert_eq!(next(state, Trigger::Interrupt), None);
        }
    }
}
