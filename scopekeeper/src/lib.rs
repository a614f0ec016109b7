//! An HTTP long-polling proxy for the Scope Transfer Protocol.
//!
//! # Architecture
//!
//! A debuggee (the *host*) connects over TCP and speaks STP/0 or, after an in-band upgrade,
//! STP/1.  Debugger front-ends (the *clients*) cannot hold that socket themselves; they talk
//! HTTP to this proxy instead:
//!
//! * `GET /services` returns the host's service list as XML.
//! * `GET /enable/<service>` turns a service on.
//! * `GET /get-message` long-polls for the next host message.
//! * `POST /post-command/<service>[/<command-id>/<tag>]` sends a command to the host.
//!
//! Everything runs on one thread.  [`Reactor`] owns the listeners and sockets; [`scope::Scope`]
//! routes messages between the host link ([`host::HostLink`]) and the client sessions
//! ([`session::ClientSession`]).
//!
//! ```no_run
//! let config = scopekeeper::Config::default();
//! let mut reactor = scopekeeper::Reactor::bind(&config).unwrap();
//! reactor.run();
//! ```

pub mod config;
pub mod fallback;
pub mod host;
pub mod http;
pub mod reactor;
pub mod rendezvous;
pub mod scope;
pub mod session;
pub mod transport;

pub use config::Config;
pub use reactor::Reactor;
