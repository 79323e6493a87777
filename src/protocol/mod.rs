//! Plugin Wire Protocol
//!
//! Message types exchanged over a `Register` stream and the framing used to
//! carry them between the host and a plugin process.

pub mod error;
pub mod message;
pub mod transport;

pub use error::{TransportError, TransportResult};
pub use message::{
    CommandDescriptor, Device, ErrorMessage, FlagDescriptor, JobResult, OptimizationItem,
    PluginMessage, PreferenceItem, Property, ReEvaluate, RegisterConfig, ResultsReady,
    ServerMessage, ServerTerminate, StartProcess,
};
pub use transport::{
    spawn_writer, spawn_writer_with_capacity, FrameReader, FrameWriter, StreamHeader,
    StreamSender, MAX_FRAME_BYTES, REGISTER_METHOD, SEND_BUFFER,
};
