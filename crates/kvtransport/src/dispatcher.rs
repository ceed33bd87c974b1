//! Retrying dispatch of units of work over pooled connections.
//!
//! Flow for one logical call:
//! 1. Lease a connection from the protocol's pool, skipping connections to
//!    nodes that already failed during this call
//! 2. Run the caller's work against it
//! 3. On a transient failure: penalize the node, blacklist it for this call,
//!    evict the connection and try again while attempts remain
//! 4. Any other failure is returned at once, with no penalty
//!
//! The attempt budget is resolved per call: an explicit [`CallOptions`] value
//! wins, then the calling thread's setting, then the configured default.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use dashmap::DashMap;

use crate::config::{ClientConfig, DEFAULT_RETRIES};
use crate::connection::{Connection, ConnectionManager, Connector, TcpConnector};
use crate::error::{Result, TransportError};
use crate::node::{Node, NodeHealth};
use crate::pool::Pool;
use crate::protocol::{Protocol, RetryClassifier};

pub type ConnectionPool<C> = Pool<ConnectionManager<C>>;

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    protocol: Option<Protocol>,
    retries: Option<usize>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the protocol (and so the pool) for this call only.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Attempt budget for this call only.
    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Outcome of a single attempt.
enum Attempt<T> {
    Success(T),
    Retryable(TransportError),
    Fatal(TransportError),
}

/// Nodes excluded for the rest of one logical call. Compared by identity.
#[derive(Default)]
struct Blacklist(Vec<Arc<Node>>);

impl Blacklist {
    fn contains(&self, node: &Arc<Node>) -> bool {
        self.0.iter().any(|n| Arc::ptr_eq(n, node))
    }

    fn insert(&mut self, node: Arc<Node>) {
        if !self.contains(&node) {
            self.0.push(node);
        }
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Per-thread attempt budgets; absent means the dispatcher default.
type RetrySettings = DashMap<ThreadId, usize>;

/// Removes a thread's entries from every settings map it wrote to, when the
/// thread exits.
struct ThreadExit {
    thread: ThreadId,
    settings: Vec<Weak<RetrySettings>>,
}

impl Drop for ThreadExit {
    fn drop(&mut self) {
        for settings in self.settings.drain(..) {
            if let Some(settings) = settings.upgrade() {
                settings.remove(&self.thread);
            }
        }
    }
}

thread_local! {
    static THREAD_EXIT: RefCell<Option<ThreadExit>> = const { RefCell::new(None) };
}

/// Arrange for `thread`'s entry in `settings` to be dropped with the thread.
fn remove_on_thread_exit(settings: &Arc<RetrySettings>, thread: ThreadId) {
    // Fails only while the thread is already tearing down its locals.
    let _ = THREAD_EXIT.try_with(|exit| {
        let mut exit = exit.borrow_mut();
        let exit = exit.get_or_insert_with(|| ThreadExit {
            thread,
            settings: Vec::new(),
        });
        exit.settings.retain(|known| known.strong_count() > 0);
        if !exit
            .settings
            .iter()
            .any(|known| std::ptr::eq(known.as_ptr(), Arc::as_ptr(settings)))
        {
            exit.settings.push(Arc::downgrade(settings));
        }
    });
}

pub struct Dispatcher<C: Connector = TcpConnector> {
    nodes: Arc<[Arc<Node>]>,
    http: ConnectionPool<C>,
    pbc: ConnectionPool<C>,
    protocol: Protocol,
    default_retries: usize,
    retries: Arc<RetrySettings>,
    classifiers: Vec<Arc<dyn RetryClassifier>>,
}

impl Dispatcher<TcpConnector> {
    /// TCP-backed dispatcher over the configured nodes.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let nodes = config
            .nodes
            .iter()
            .map(|node| Arc::new(Node::from_config(node)))
            .collect();
        Ok(Self::new(nodes, TcpConnector::from_config(config)?)
            .with_protocol(config.protocol)
            .with_default_retries(config.retries))
    }
}

impl<C: Connector> Dispatcher<C> {
    pub fn new(nodes: Vec<Arc<Node>>, connector: C) -> Self {
        let nodes: Arc<[Arc<Node>]> = nodes.into();
        let connector = Arc::new(connector);
        let classifiers = Protocol::ALL
            .into_iter()
            .map(|protocol| Arc::new(protocol) as Arc<dyn RetryClassifier>)
            .collect();

        Self {
            http: Pool::new(ConnectionManager::new(
                Protocol::Http,
                Arc::clone(&nodes),
                Arc::clone(&connector),
            )),
            pbc: Pool::new(ConnectionManager::new(
                Protocol::Pbc,
                Arc::clone(&nodes),
                connector,
            )),
            nodes,
            protocol: Protocol::default(),
            default_retries: DEFAULT_RETRIES,
            retries: Arc::new(DashMap::new()),
            classifiers,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_default_retries(mut self, retries: usize) -> Self {
        self.default_retries = retries;
        self
    }

    /// Register an extra retryability predicate alongside the protocol ones.
    pub fn with_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifiers.push(classifier);
        self
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Protocol used when a call does not force one.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn pool(&self, protocol: Protocol) -> &ConnectionPool<C> {
        match protocol {
            Protocol::Http => &self.http,
            Protocol::Pbc => &self.pbc,
        }
    }

    /// Attempt budget for calls made from the current thread.
    pub fn retries(&self) -> usize {
        self.retries
            .get(&thread::current().id())
            .map(|retries| *retries)
            .unwrap_or(self.default_retries)
    }

    /// Set the attempt budget for the current thread.
    pub fn set_retries(&self, retries: usize) {
        let thread = thread::current().id();
        remove_on_thread_exit(&self.retries, thread);
        self.retries.insert(thread, retries);
    }

    /// Override the current thread's attempt budget until the guard drops.
    pub fn retry_scope(&self, retries: usize) -> RetryScope<'_, C> {
        let thread = thread::current().id();
        remove_on_thread_exit(&self.retries, thread);
        let previous = self.retries.insert(thread, retries);
        RetryScope {
            dispatcher: self,
            thread,
            previous,
            _not_send: PhantomData,
        }
    }

    /// Run `f` with the current thread's attempt budget set to `retries`.
    /// The previous budget is restored even if `f` panics.
    pub fn with_retries<T>(&self, retries: usize, f: impl FnOnce() -> T) -> T {
        let _scope = self.retry_scope(retries);
        f()
    }

    /// I/O failures are always transient; anything else is transient if any
    /// registered classifier says so.
    pub fn is_retryable(&self, error: &TransportError) -> bool {
        matches!(error, TransportError::Io(_))
            || self
                .classifiers
                .iter()
                .any(|classifier| classifier.is_retryable(error))
    }

    pub fn run<T, F>(&self, work: F) -> Result<T>
    where
        F: FnMut(&mut Connection<C::Stream>) -> Result<T>,
    {
        self.run_with(CallOptions::default(), work)
    }

    /// Run `work` against one connection at a time until it succeeds, fails
    /// fatally, or the attempt budget is spent. On exhaustion the last
    /// transient error is returned unchanged.
    pub fn run_with<T, F>(&self, options: CallOptions, mut work: F) -> Result<T>
    where
        F: FnMut(&mut Connection<C::Stream>) -> Result<T>,
    {
        let protocol = options.protocol.unwrap_or(self.protocol);
        let pool = self.pool(protocol);
        let attempts = options.retries.unwrap_or_else(|| self.retries()).max(1);
        let mut blacklist = Blacklist::default();

        let mut attempt = 1;
        loop {
            match self.attempt(pool, &mut blacklist, &mut work) {
                Attempt::Success(value) => return Ok(value),
                Attempt::Fatal(error) => {
                    tracing::debug!(%protocol, attempt, error = %error, "Fatal failure");
                    return Err(error);
                }
                Attempt::Retryable(error) if attempt >= attempts => {
                    tracing::warn!(%protocol, attempts, error = %error, "Retry budget exhausted");
                    return Err(error);
                }
                Attempt::Retryable(error) => {
                    tracing::debug!(
                        %protocol,
                        attempt,
                        attempts,
                        blacklisted = blacklist.len(),
                        error = %error,
                        "Transient failure - retrying"
                    );
                    attempt += 1;
                }
            }
        }
    }

    fn attempt<T, F>(
        &self,
        pool: &ConnectionPool<C>,
        blacklist: &mut Blacklist,
        work: &mut F,
    ) -> Attempt<T>
    where
        F: FnMut(&mut Connection<C::Stream>) -> Result<T>,
    {
        let mut lease = match pool.take_filtered(|conn| !blacklist.contains(conn.node())) {
            Ok(lease) => lease,
            // Opening a connection failed; the manager already penalized the node.
            Err(error) => return self.classify(error),
        };

        match work(&mut *lease) {
            Ok(value) => Attempt::Success(value),
            Err(error) if self.is_retryable(&error) => {
                let node = Arc::clone(lease.node());
                node.error_rate().incr(1.0);
                tracing::debug!(
                    connection = %lease.id(),
                    node = %node,
                    error = %error,
                    "Evicting connection after transient failure"
                );
                blacklist.insert(node);
                lease.evict();
                Attempt::Retryable(error)
            }
            Err(error) => Attempt::Fatal(error),
        }
    }

    fn classify<T>(&self, error: TransportError) -> Attempt<T> {
        if self.is_retryable(&error) {
            Attempt::Retryable(error)
        } else {
            Attempt::Fatal(error)
        }
    }

    /// Health of every configured node.
    pub fn node_health(&self) -> Vec<NodeHealth> {
        self.nodes.iter().map(|node| node.health()).collect()
    }

    /// Close every pooled connection of both protocols.
    pub fn clear(&self) {
        self.http.clear();
        self.pbc.clear();
    }
}

impl<C: Connector> std::fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("nodes", &self.nodes.len())
            .field("protocol", &self.protocol)
            .field("default_retries", &self.default_retries)
            .field("http", &self.http)
            .field("pbc", &self.pbc)
            .finish()
    }
}

/// Restores the thread's previous attempt budget on drop.
///
/// Not `Send`: it must be dropped on the thread that created it.
#[must_use = "the override ends when the scope guard is dropped"]
pub struct RetryScope<'a, C: Connector> {
    dispatcher: &'a Dispatcher<C>,
    thread: ThreadId,
    previous: Option<usize>,
    _not_send: PhantomData<*const ()>,
}

impl<C: Connector> Drop for RetryScope<'_, C> {
    fn drop(&mut self) {
        match self.previous {
            Some(previous) => {
                self.dispatcher.retries.insert(self.thread, previous);
            }
            None => {
                self.dispatcher.retries.remove(&self.thread);
            }
        }
    }
}
