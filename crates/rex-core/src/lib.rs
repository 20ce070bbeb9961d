//! rex-core: building blocks for running and recording remote commands.
//!
//! Provides the event recorder and its replay, streaming escape-sequence
//! detection, signal identifiers, host-key policies, layered cancellation,
//! and the collaborator traits a transport backend implements.

pub mod callback;
pub mod cancel;
pub mod error;
pub mod escape;
pub mod hostkey;
pub mod recorder;
pub mod signal;
pub mod transport;

// Re-export commonly used items at crate root.
pub use error::{RexError, RexResult};
pub use escape::{EscapeMatcher, EscapeReader, EscapeSequences};
pub use hostkey::{fingerprint, HostKeyPolicy};
pub use recorder::{OutputEvent, OutputStream, Recorder, SpecialEvent, ESCAPE_EVENT};
pub use signal::Signal;
pub use transport::{
    Authorizer, BoxConn, Connector, Dialer, HandshakeParams, PtyRequest, RemoteClient,
    RemoteSession, SessionIo, WindowSize,
};
