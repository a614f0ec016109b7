// SPDX-License-Identifier: MIT OR Apache-2.0
//! The event loop.
//!
//! A single thread owns both listeners, the [`Scope`] and every [`ClientSession`].  Each
//! [`Reactor::tick`] accepts new connections, moves bytes in both directions and expires
//! overdue long-polls; [`Reactor::run`] repeats that forever, sleeping when a tick found
//! nothing to do.

use crate::config::Config;
use crate::fallback::{Fallback, NotFound};
use crate::scope::{Delivery, Scope, ScopeOptions, SessionId};
use crate::session::ClientSession;
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct Reactor {
    http_listener: TcpListener,
    host_listener: TcpListener,
    scope: Scope,
    sessions: BTreeMap<SessionId, ClientSession>,
    next_session: u64,
    fallback: Box<dyn Fallback>,
    tick_interval: Duration,
}

fn listen(addr: String) -> Result<TcpListener, Error> {
    let listener = TcpListener::bind(&addr).map_err(|source| Error::Bind {
        addr: addr.clone(),
        source,
    })?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Accepts one pending connection, if any.
///
/// Accept failures, descriptor exhaustion included, are logged and skipped.
fn accept(listener: &TcpListener) -> Option<(TcpStream, SocketAddr)> {
    accept_with(|| listener.accept())
}

fn accept_with(
    mut next: impl FnMut() -> io::Result<(TcpStream, SocketAddr)>,
) -> Option<(TcpStream, SocketAddr)> {
    loop {
        match next() {
            Ok((stream, addr)) => {
                let configured = stream
                    .set_nonblocking(true)
                    .and_then(|()| stream.set_nodelay(true));
                if let Err(e) = configured {
                    logwise::warn_sync!(
                        "dropping connection from {addr}: {err}",
                        addr = logwise::privacy::LogIt(&addr),
                        err = logwise::privacy::LogIt(&e)
                    );
                    continue;
                }
                return Some((stream, addr));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::Interrupted | ErrorKind::ConnectionAborted
                ) =>
            {
                continue;
            }
            Err(e) => {
                logwise::warn_sync!(
                    "accept failed: {err}",
                    err = logwise::privacy::LogIt(&e)
                );
                return None;
            }
        }
    }
}

impl Reactor {
    /// Binds the HTTP and host listeners described by `config`.
    pub fn bind(config: &Config) -> Result<Reactor, Error> {
        let http_listener = listen(config.http_addr())?;
        let host_listener = listen(config.host_addr())?;
        Ok(Reactor {
            http_listener,
            host_listener,
            scope: Scope::new(ScopeOptions::from(config)),
            sessions: BTreeMap::new(),
            next_session: 1,
            fallback: Box::new(NotFound),
            tick_interval: config.tick_interval(),
        })
    }

    /// Replaces the handler for GET requests outside the scope commands.
    pub fn with_fallback(mut self, fallback: Box<dyn Fallback>) -> Reactor {
        self.fallback = fallback;
        self
    }

    pub fn http_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.http_listener.local_addr()?)
    }

    pub fn host_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.host_listener.local_addr()?)
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs one pass of the loop.  Returns whether anything happened.
    pub fn tick(&mut self, now: Instant) -> bool {
        let mut did_stuff = false;

        while let Some((stream, addr)) = accept(&self.host_listener) {
            logwise::info_sync!(
                "host connected from {addr}",
                addr = logwise::privacy::LogIt(&addr)
            );
            self.scope.set_host(Box::new(stream));
            did_stuff = true;
        }

        while let Some((stream, addr)) = accept(&self.http_listener) {
            let id = SessionId(self.next_session);
            self.next_session += 1;
            if self.scope.options().debug {
                logwise::info_sync!(
                    "client {id} connected from {addr}",
                    id = logwise::privacy::LogIt(&id),
                    addr = logwise::privacy::LogIt(&addr)
                );
            }
            self.sessions
                .insert(id, ClientSession::new(id, Box::new(stream)));
            did_stuff = true;
        }

        let (host_active, deliveries) = self.scope.poll_host();
        did_stuff |= host_active;
        self.dispatch(deliveries);

        for session in self.sessions.values_mut() {
            did_stuff |= session.process(&mut self.scope, self.fallback.as_ref(), now);
        }

        let expired = self.scope.expire(now);
        did_stuff |= !expired.is_empty();
        self.dispatch(expired);

        did_stuff |= self.scope.flush_host();
        for session in self.sessions.values_mut() {
            did_stuff |= session.flush();
        }

        let closed: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_closed())
            .map(ClientSession::id)
            .collect();
        let mut undelivered = Vec::new();
        for id in closed {
            if let Some(mut session) = self.sessions.remove(&id) {
                undelivered.extend(session.take_undelivered());
            }
            self.scope.client_disconnected(id);
            did_stuff = true;
        }
        for message in undelivered {
            if let Some(next) = self.scope.redeliver(message) {
                self.dispatch(vec![next]);
            }
        }
        did_stuff
    }

    /// Hands each delivery to its session.  A message whose session is gone (or no longer
    /// waiting) goes back to the front of the queue, where it may find another waiter.
    fn dispatch(&mut self, deliveries: Vec<Delivery>) {
        let format = self.scope.options().format;
        let debug = self.scope.options().debug;
        let mut work = VecDeque::from(deliveries);
        while let Some(delivery) = work.pop_front() {
            let id = delivery.session();
            let returned = match self.sessions.get_mut(&id) {
                Some(session) => session.deliver(delivery, format, debug),
                None => match delivery {
                    Delivery::Message { message, .. } => Some(message),
                    _ => None,
                },
            };
            if let Some(message) = returned {
                self.scope.cancel_poll(id);
                if let Some(next) = self.scope.redeliver(message) {
                    work.push_back(next);
                }
            }
        }
    }

    /// Ticks forever, sleeping between idle passes.
    pub fn run(&mut self) -> ! {
        loop {
            if !self.tick(Instant::now()) {
                std::thread::sleep(self.tick_interval);
            }
        }
    }
}
