pub mod error;
pub mod frame;
pub mod protocol;

pub use error::{FrameError, SpawnError, ValidationError};
pub use frame::{FeedReport, LineReassembler, Record, Utf8Carry, DEFAULT_MAX_RECORD_BYTES};
pub use protocol::{
    decode_turn_request, encode_event, init_session_id, parse_terminal_input, SessionStatus,
    TerminalEvent, TerminalInput, TurnEvent, TurnRequest, MAX_INBOUND_BYTES,
};
