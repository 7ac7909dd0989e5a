//! Line-oriented PTY sessions for driving interactive interpreters.
//!
//! This crate spawns a command under a pseudo-terminal, splits its raw
//! output into complete lines, and broadcasts those lines together with a
//! single exit event. It has no knowledge of any particular interpreter's
//! protocol; framing and response correlation live in higher layers.
//!
//! # Example
//!
//! ```no_run
//! use pty_session::{PtyConfig, PtyEvent, PtySession};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PtyConfig {
//!         command: "/bin/cat".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let handle = PtySession::spawn(config).unwrap();
//!     let mut events = handle.subscribe();
//!
//!     handle.write_line("hello").await.unwrap();
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             PtyEvent::Line { text, .. } => println!("line: {}", text),
//!             PtyEvent::Exited { code } => {
//!                 println!("exited: {:?}", code);
//!                 break;
//!             }
//!         }
//!     }
//! }
//! ```

mod error;
mod session;

pub use error::PtyError;
pub use session::{PtyConfig, PtyEvent, PtyHandle, PtySession};
