// lib.rs — OVMS v2 command protocol: grammar, frame layout, session cipher

pub mod cipher;
pub mod error;
pub mod frame;
pub mod grammar;

pub use cipher::{CipherSession, Direction, Endpoint, Sealed, SessionMaterial, KEYSTREAM_DROP, TAG_LEN};
pub use error::{CipherError, MalformedCommand, MalformedFrame, RejectedCommand};
pub use frame::{Frame, HEADER_LEN, MAX_PAYLOAD, UNSOLICITED_TOKEN};
pub use grammar::{
    decode, encode, route_for, CanonicalCommand, Command, CommandKind, CommandResponse, ResultCode,
    Route, VehicleFamily, Wheel, COMMAND_PREFIX, KEEPALIVE, KEEPALIVE_REPLY, RESPONSE_PREFIX,
};

// =============================== Common =====================================

pub const PROTOCOL_VERSION: u16 = 2;
pub const DEFAULT_RELAY_PORT: u16 = 6867;
