//! # Request Server
//!
//! The local signing endpoint: a Unix domain socket speaking length-prefixed
//! JSON, one request per connection.
//!
//! - [`messages`]: request and response bodies
//! - [`transport`]: the frame codec
//! - [`recovery`]: the share-collection state machine
//! - [`dispatch`]: [`StampService`], which turns a frame into a response
//! - [`listener`]: [`IpcServer`], the accept loop

pub mod dispatch;
pub mod listener;
pub mod messages;
pub mod recovery;
pub mod transport;

pub use dispatch::{Caller, ServiceError, StampService};
pub use listener::IpcServer;
pub use messages::{
    DeleteKeyParams, DeleteKeyResponse, ErrorResponse, Method, RecoverStartParams, RecoveryStatus,
    Request, ServiceStatus, ShareCreationOptions, SignRequest, SignedResponse, VerifyShareParams,
};
pub use recovery::{Progress, RecoveryError, RecoverySession};
pub use transport::{read_frame, write_frame, TransportError};
