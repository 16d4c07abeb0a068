//! WOP agent overlay — wire protocol types and serialisation.

pub mod codec;
pub mod envelope;
pub mod exit;
pub mod friend;

pub use codec::{read_frame, parse_frame, write_frame, CodecError, MAX_FRAME_BYTES, MAX_PAYLOAD_BYTES};
pub use envelope::{negotiate, Body, Envelope, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
pub use exit::ExitCode;
