use thiserror::Error;

use super::event::ErrorCode;
use super::state::ComponentState;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation not allowed in state {0}")]
    IncorrectStateOperation(ComponentState),

    #[error("Transition from {from} to {to} is not allowed")]
    IncorrectStateTransition {
        from: ComponentState,
        to: ComponentState,
    },

    #[error("Ports not compatible: {0}")]
    PortsNotCompatible(String),

    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("Bad port index: {0}")]
    BadPortIndex(u32),

    #[error("No usable stream detected: {0}")]
    FormatNotDetected(String),

    #[error("Component is already in state {0}")]
    SameState(ComponentState),

    #[error("Buffer overflow: {0}")]
    Overflow(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Unsupported index: {0}")]
    UnsupportedIndex(String),

    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    #[error("Undefined failure: {0}")]
    Undefined(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Code reported through [`Event::Error`](super::event::Event::Error) when
    /// this failure happens on a worker thread.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InsufficientResources(_) => ErrorCode::InsufficientResources,
            Self::InvalidState(_) => ErrorCode::InvalidState,
            Self::IncorrectStateOperation(_) => ErrorCode::IncorrectStateOperation,
            Self::IncorrectStateTransition { .. } => ErrorCode::IncorrectStateTransition,
            Self::PortsNotCompatible(_) => ErrorCode::PortsNotCompatible,
            Self::BadParameter(_) => ErrorCode::BadParameter,
            Self::BadPortIndex(_) => ErrorCode::BadPortIndex,
            Self::FormatNotDetected(_) => ErrorCode::FormatNotDetected,
            Self::SameState(_) => ErrorCode::SameState,
            Self::Overflow(_) => ErrorCode::Overflow,
            Self::NotImplemented(_) => ErrorCode::NotImplemented,
            Self::UnsupportedIndex(_) => ErrorCode::UnsupportedIndex,
            Self::ComponentNotFound(_) => ErrorCode::ComponentNotFound,
            Self::Undefined(_) | Self::Configuration(_) | Self::Io(_) | Self::Other(_) => {
                ErrorCode::Undefined
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_follow_variant() {
        assert_eq!(
            PipelineError::PortsNotCompatible("domain".into()).code(),
            ErrorCode::PortsNotCompatible
        );
        assert_eq!(
            PipelineError::SameState(ComponentState::Idle).code(),
            ErrorCode::SameState
        );
        let io = std::io::Error::other("device gone");
        assert_eq!(PipelineError::from(io).code(), ErrorCode::Undefined);
    }

    #[test]
    fn test_transition_error_message() {
        let err = PipelineError::IncorrectStateTransition {
            from: ComponentState::Loaded,
            to: ComponentState::Executing,
        };
        assert_eq!(
            err.to_string(),
            "Transition from Loaded to Executing is not allowed"
        );
    }
}
