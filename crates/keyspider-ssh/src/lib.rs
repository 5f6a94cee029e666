//! keyspider-ssh: SSH transport for the Keyspider engine.
//!
//! The engine talks to remote hosts exclusively through the [`SshDialer`] /
//! [`SshSession`] traits, so everything above the transport is testable with
//! scripted fakes. The production implementation ([`russh_transport`]) dials
//! with russh and performs file access over SFTP only.

pub mod error;
pub mod pool;
pub mod russh_transport;
pub mod session;
pub mod sftp;

pub use error::SshError;
pub use pool::{ConnectionPool, Lease};
pub use session::{ExecOutput, FileStat, SshDialer, SshSession};
pub use sftp::SftpReader;
