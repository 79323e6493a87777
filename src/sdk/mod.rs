//! Plugin SDK
//!
//! Everything a plugin executable needs to talk to the host: the stream
//! client, a bounded job worker pool that reports progress as `JobResult`
//! messages, and a runner that dispatches host requests to a [`Processor`].

pub mod error;
pub mod job_queue;
pub mod plugin;
pub mod stream;

pub use error::{SdkError, SdkResult};
pub use job_queue::{job_fn, FnJob, Job, JobProperties, JobQueue};
pub use plugin::{serve, PluginArgs, PluginRunner, ProcessContext, Processor};
pub use stream::{connect, HostStream};
