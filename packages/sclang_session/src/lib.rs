//! Managed sclang interpreter sessions.
//!
//! sclang speaks a raw interactive text protocol: commands go in as
//! newline-terminated strings, free-form lines come back, and nothing ever
//! says "response complete". This crate spawns the interpreter under a
//! pseudo-terminal (it only behaves interactively when attached to one),
//! infers response boundaries from output quiescence, correlates each
//! command with its aggregated response, and parses the MIDI device
//! enumeration into a typed table.
//!
//! All session state lives in a single actor task; callers on any number
//! of tasks submit commands through a cloneable [`SclangSession`] handle
//! and are serialized, one command in flight at a time.
//!
//! # Example
//!
//! ```no_run
//! use sclang_session::{SclangSession, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = SclangSession::start(SessionConfig::default()).await?;
//!
//!     // The caller created "synthport-out" as a virtual MIDI port before
//!     // initializing; the enumeration response tells us how sclang
//!     // addresses every destination.
//!     let devices = session.init_midi("synthport-out").await?;
//!     for (name, entry) in devices.iter() {
//!         println!("{name}: uid {} index {}", entry.uid, entry.index);
//!     }
//!
//!     session.send("s.boot;").await?;
//!     session.quit().await?;
//!     Ok(())
//! }
//! ```

mod aggregator;
mod config;
mod correlator;
mod devices;
mod error;
mod session;
mod token;

pub use config::SessionConfig;
pub use devices::{DEVICE_LINE_MARKER, DeviceEntry, DeviceParseError, DeviceTable, parse_device_table};
pub use error::SessionError;
pub use session::{ProgramLoader, SclangSession, SequencePlayer};
pub use token::tokenize;
