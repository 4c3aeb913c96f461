//! # gemwire
//!
//! gemwire is a Gemini protocol engine: a client and a server for the
//! protocol described at [gemini://geminiprotocol.net/docs/protocol-specification.gmi](gemini://geminiprotocol.net/docs/protocol-specification.gmi).
//!
//! The client follows redirects and answers certificate requests with
//! transient, per-origin certificates when asked to. The server reads one
//! request line per connection and hands it to a [`Handler`].
//!
//! ```no_run
//! # async fn run() -> gemwire::Result<()> {
//! use gemwire::{ClientOptions, client};
//!
//! let options = ClientOptions::new().hostname("geminiprotocol.net").follow_redirects(true);
//! let response = client::request("/", options).await?;
//! println!("{} {}", response.status(), response.meta());
//! println!("{}", response.text().await?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unused_imports)]

pub mod client;
pub mod error;
pub mod identity;
pub mod mime;
pub mod parser;
pub mod server;
pub mod status;
pub mod tls;
pub mod url;

pub use client::{
    CertPrompt, Client, ClientOptions, FollowRedirects, Timeouts,
    certs::{CertificateStore, TransientCertStore},
    response::Response,
    tofu::{KnownHosts, ServerTrust},
};
pub use error::{Error, Result, TimeoutPhase};
pub use identity::Identity;
pub use mime::MimeType;
pub use parser::{Body, ResponseHeader};
pub use server::{Handler, Server, ServerOptions, response::ResponseWriter};
pub use status::{Category, Status};
pub use tls::VerifyAlpn;
pub use crate::url::Origin;
