//! letterbox turns email newsletters into Atom feeds and pushes new entries
//! to WebSub subscribers.
//!
//! Mail arrives over SMTP ([`mail`]), is stored as a size-bounded feed
//! ([`storage`]) and served over HTTP ([`http`]). Subscription handshakes
//! and content distribution run as background jobs ([`websub`], [`worker`]).

pub mod atom;
pub mod config;
pub mod context;
pub mod http;
pub mod links;
pub mod mail;
pub mod storage;
pub mod util;
pub mod websub;
pub mod worker;

pub use config::Config;
pub use context::Context;
