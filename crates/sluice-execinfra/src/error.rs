use sluice_core::{NodeId, ProcessorId};

#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "unknown processor core '{_0}'")]
    UnknownCore(String),
    #[display(fmt = "invalid spec for processor {processor_id}: {reason}")]
    InvalidProcessor {
        processor_id: ProcessorId,
        reason: String,
    },
    #[display(fmt = "unknown setting '{_0}'")]
    UnknownSetting(String),
    #[display(fmt = "invalid value '{value}' for setting '{name}'")]
    InvalidSetting { name: String, value: String },
    #[display(fmt = "failed to create server config")]
    ServerConfig,
    #[display(fmt = "stream closed by peer")]
    StreamClosed,
    #[display(fmt = "failed to decode {_0}")]
    Decode(&'static str),
    #[display(fmt = "no route to node {_0}")]
    NodeUnavailable(NodeId),
    #[display(fmt = "no node dialer configured")]
    NoDialer,
}

impl error_stack::Context for Error {}
