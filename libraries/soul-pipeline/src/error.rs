//! Error types for the pipeline controller

use crate::graph::description::DescriptionError;
use std::time::Duration;
use thiserror::Error;

/// Pipeline controller errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The graph could not be constructed (malformed source, missing capability)
    #[error("Initialization failed: {0}")]
    InitializationFailure(String),

    /// Decode output could not be connected to the effects chain
    #[error("Link failed: {0}")]
    LinkFailure(String),

    /// A bounded wait on a state transition expired
    #[error("State transition did not settle within {0:?}")]
    StateTransitionTimeout(Duration),

    /// Decode or demux error reported by the graph runtime
    #[error("Stream error: {message}")]
    StreamError {
        message: String,
        domain: i32,
        code: i32,
    },

    /// An operation was called outside of its documented window
    #[error("Contract violation: {0}")]
    ContractViolation(&'static str),

    /// The instance latched invalid and refuses further control calls
    #[error("Pipeline is no longer valid")]
    Invalid,

    /// Graph runtime failure
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors raised by a graph runtime implementation
#[derive(Debug, Error)]
pub enum GraphError {
    /// The runtime has no element for this factory name
    #[error("No element named \"{0}\"")]
    MissingElement(String),

    /// An element property could not be applied
    #[error("Invalid value for {element}.{property}: {value}")]
    InvalidProperty {
        element: String,
        property: String,
        value: String,
    },

    /// The raw graph description did not parse
    #[error(transparent)]
    Description(#[from] DescriptionError),

    /// The decode stage plan cannot be used by this runtime
    #[error("Unsupported decode stage: {0}")]
    UnsupportedSource(String),

    /// Output device could not be opened
    #[error("Output error: {0}")]
    Output(String),

    /// The graph's streaming thread is gone
    #[error("Graph has been shut down")]
    Shutdown,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type for graph runtime operations
pub type GraphResult<T> = std::result::Result<T, GraphError>;
