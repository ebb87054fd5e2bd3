//! Loosely coupled page widgets coordinated over named broadcast channels.
//!
//! Blocks are declared on document elements, mounted by a [`BlockHost`], and
//! talk to each other only through channel names on a shared [`ChannelBus`].

pub mod blocks;
pub mod channels;
pub mod dom;
pub mod error;
pub mod geometry;
pub mod logging;
pub mod metrics;
pub mod modes;
pub mod runtime;

pub use blocks::standard_registry;
pub use channels::{ChannelBus, ChannelError, EmitReport, Message, MessageTag, Subscription};
pub use dom::{Document, Fragment, Region, RegionSpec, SharedDocument};
pub use error::{BlockError, Result};
pub use geometry::{Rect, Size};
pub use logging::{
    FileSink, LogEvent, LogLevel, LogSink, Logger, LoggingError, LoggingResult, MemorySink,
};
pub use metrics::{HostMetrics, MetricSnapshot};
pub use modes::{DisplayController, ModeDescriptor, ModeTable, RegionMarks};
pub use runtime::arbitration::{ModalArbitrator, ModalState, SharedArbitrator, ensure_arbitrator};
pub use runtime::diagnostics::ChannelTap;
pub use runtime::shared_state::{SharedState, SharedStateError};
pub use runtime::transport::{
    FetchClient, FetchRequest, Method, QueuedTransport, RequestId, Transport, TransportError,
};
pub use runtime::{
    Block, BlockContext, BlockHost, BlockKey, BlockRegistry, BlockSpec, EventFlow, HostConfig,
    HostEvent,
};
