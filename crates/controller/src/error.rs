//! Controller error types

use contracts::{HubError, SessionState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// A session needs at least one device in the `Ready` state
    #[error("no devices are ready for a session")]
    NoReadyDevices,

    /// A session lifecycle operation arrived in the wrong state
    #[error("session already active in state {state:?}")]
    SessionActive { state: SessionState },

    /// Stop/abort requested with nothing running
    #[error("no session in progress")]
    NoActiveSession,

    #[error(transparent)]
    Transport(#[from] HubError),
}
