//! The control-plane core of a programmable FPGA timing/data-acquisition
//! device: a command dispatcher over a polymorphic class/type/attribute
//! registry, a change-index service, a double-buffered table engine, and
//! the three-file config database loader that builds all of it.

mod attributes;
mod bus;
mod change;
mod classes;
pub mod data_options;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod hardware;
mod mux;
mod names;
mod parse;
pub mod runtime;
mod table;
mod types;

pub use attributes::Attribute;
pub use change::ChangeFamily;
pub use classes::FieldClass;
pub use database::Database;
pub use dispatch::Dispatcher;
pub use dispatch::Session;
pub use error::CommandError;
pub use error::LoadError;
pub use hardware::HardwareBackend;
pub use runtime::Runtime;
