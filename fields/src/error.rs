//! Error categories from spec.md §7. `CommandError` is what every dispatch
//! path returns; the dispatcher's only job with it is to format it as
//! `ERR {message}` to the client. `LoadError` is startup-fatal: `main()`
//! logs it and exits non-zero.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[remain::sorted]
pub enum CommandError {
    // -- capability errors --
    #[error("Field is not a table")]
    NotATable,
    #[error("Field not readable")]
    NotReadable,
    #[error("Field not writeable")]
    NotWriteable,

    // -- domain errors --
    #[error("Block index too high")]
    BlockIndexTooHigh,
    #[error("Capture index out of range")]
    CaptureIndexOutOfRange,
    #[error("Position out of range")]
    PositionOutOfRange,
    #[error("Time setting out of range")]
    TimeOutOfRange,
    #[error("Value too small")]
    ValueTooSmall,

    // -- lookup errors --
    #[error("Meta-field not found")]
    MetaFieldNotFound,
    #[error("Mux selector not known")]
    MuxSelectorNotKnown,
    #[error("No such block")]
    NoSuchBlock,
    #[error("No such field")]
    NoSuchField,

    // -- parse errors --
    #[error("Malformed field list request")]
    MalformedFieldListRequest,
    #[error("Unexpected text after command")]
    UnexpectedText,
    #[error("Unknown command")]
    UnknownCommand,

    // -- state errors --
    #[error("Capture in progress")]
    CaptureInProgress,
    #[error("Table currently being written")]
    TableBeingWritten,

    // catch-all for message text that does not have a fixed category, e.g.
    // "invalid number: {0}" produced deep inside a type parser.
    #[error("{0}")]
    Other(String),
}

impl CommandError {
    pub fn other(msg: impl Into<String>) -> Self {
        CommandError::Other(msg.into())
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[remain::sorted]
pub enum LoadError {
    #[error("config file parse error: {0}")]
    ConfigParse(String),
    #[error("failed to open hardware interface: {0}")]
    HardwareOpen(String),
    #[error("register validation failed: {0}")]
    RegisterValidation(String),
}

pub type LoadResult<T> = Result<T, LoadError>;
