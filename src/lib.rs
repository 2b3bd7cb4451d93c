//! # Braid
//!
//! Braid multiplexes many independent, reliable, ordered, bidirectional byte
//! streams over a single underlying reliable transport such as a TCP
//! connection. The protocol is symmetric: either peer may open streams, send
//! data under credit-based flow control, probe the connection with pings, and
//! signal graceful shutdown with a go-away.
//!
//! The transport only needs to implement the futures-io byte-stream contract
//! (`AsyncRead + AsyncWrite + Unpin + Send`). Construction hands back a
//! [`Session`] handle together with a [`SessionDriver`] future that runs the
//! session's receive and send loops; the caller spawns the driver on whatever
//! executor they use.
//!
//! ```no_run
//! # async fn demo<T>(transport: T) -> Result<(), braid::Error>
//! # where T: futures::io::AsyncRead + futures::io::AsyncWrite + Unpin + Send + 'static {
//! let (session, driver) = braid::Session::client(transport, braid::Config::default())?;
//! # let spawn = |_: braid::SessionDriver| {};
//! spawn(driver);
//!
//! let stream = session.open().await?;
//! stream.write_all(b"hello").await?;
//! stream.close().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod frame;
mod io;
pub mod session;
pub mod stream;

pub use config::Config;
pub use error::Error;
pub use session::{Role, Session, SessionDriver};
pub use stream::Stream;
