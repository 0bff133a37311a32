//! A host-side bridge to an ICE debug probe: frame codec, fragment
//! reassembly, version/capability negotiation, an MBus register/memory
//! transport, a GDB remote-serial server, and a target simulator for
//! testing without hardware.

pub mod config;
pub mod defrag;
pub mod error;
pub mod frame;
pub mod gdb;
pub mod goc;
pub mod mbus;
pub mod serial;
pub mod session;
pub mod simulator;
pub mod target;

pub use error::{IceError, IceResult};
