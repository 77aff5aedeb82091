use crate::{MIN_ACCEPTED_VERSION, VERSION};

/// Errors decoding or validating wire messages.
#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "failed to decode {_0}")]
    Decode(&'static str),
    #[display(fmt = "message {_0} has no value set")]
    MissingValue(&'static str),
    #[display(fmt = "unknown {what} {value}")]
    UnknownEnumValue { what: &'static str, value: i32 },
    #[display(fmt = "invalid flow id")]
    InvalidFlowId,
    #[display(
        fmt = "incompatible protocol version: peer has version {peer_version} accepting \
               {peer_min_accepted} and later, local version {VERSION} accepting \
               {MIN_ACCEPTED_VERSION} and later"
    )]
    VersionMismatch {
        peer_version: u32,
        peer_min_accepted: u32,
    },
}

impl error_stack::Context for Error {}
