pub mod lockout;
pub mod reason;
pub mod store;
pub mod terminator;

pub use lockout::{active_session_keys, check_lockout, set_lockout, stored_session, LockoutStatus, StoredSession};
pub use reason::{describe_reason, TerminalView, TerminationReason};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use terminator::{
    ChannelNavigator, SessionIdentity, SessionTerminator, TerminalNavigator, TerminationHandle, TerminationOutcome,
    TerminationRecord, WarningRecorder,
};
