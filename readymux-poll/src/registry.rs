//! Readiness registry.
//!
//! A [`Registry`] tracks a set of endpoint subscriptions and performs a
//! blocking "wait until any subscribed interest becomes ready" with a bounded
//! timeout, built on `poll(2)`. Each registry instance is meant to be owned
//! by a single logical operation and released before that operation's scope
//! ends; [`RegistryGuard`] provides the release-on-every-exit-path wrapper.

use crate::interest::Interest;
use crate::last_error::{record_error, ErrorCode};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Opaque token identifying one endpoint across the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(RawFd);

impl EndpointId {
    /// Builds a token from a raw descriptor.
    pub fn from_raw(fd: RawFd) -> Self {
        EndpointId(fd)
    }

    /// The raw descriptor behind this token.
    pub fn as_raw(self) -> RawFd {
        self.0
    }
}

/// Readiness notification for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    /// The endpoint that became ready.
    pub id: EndpointId,
    /// The subset of subscribed interests that is currently satisfied.
    pub readiness: Interest,
}

/// Registry behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryFlags {
    /// Permit waiting on a registry with no subscriptions (the wait then
    /// simply times out instead of failing up front).
    pub allow_empty: bool,
    /// Probe for already-satisfied readiness before blocking.
    pub check_output: bool,
}

/// Registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("registry has been released")]
    InvalidState,

    #[error("no subscriptions in the registry")]
    EmptySet,

    #[error("wait timed out with no ready endpoint")]
    Timeout,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to allocate a registry: {0}")]
    Resource(String),
}

struct Subscription {
    fd: RawFd,
    interest: Interest,
    /// Interests already delivered to an edge-triggered subscriber and not
    /// yet observed not-ready again. Always empty for level-triggered
    /// subscriptions.
    reported: Interest,
}

struct Inner {
    subs: BTreeMap<EndpointId, Subscription>,
    /// Rotation cursor so successive capacity-limited batches cover
    /// different subscriptions instead of starving the tail.
    cursor: usize,
}

struct SubSnapshot {
    id: EndpointId,
    fd: RawFd,
    interest: Interest,
    reported: Interest,
}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Subscription set with a blocking multiplexed wait.
pub struct Registry {
    id: u64,
    inner: Mutex<Inner>,
    flags: Mutex<RegistryFlags>,
    released: AtomicBool,
}

impl Registry {
    /// Allocates a new registry with no subscriptions and default flags.
    pub fn new() -> Result<Registry, PollError> {
        let id = NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed);
        if id == u64::MAX {
            record_error(ErrorCode::Resource, "registry ids exhausted");
            return Err(PollError::Resource("registry ids exhausted".into()));
        }
        Ok(Registry {
            id,
            inner: Mutex::new(Inner {
                subs: BTreeMap::new(),
                cursor: 0,
            }),
            flags: Mutex::new(RegistryFlags::default()),
            released: AtomicBool::new(false),
        })
    }

    /// True until [`Registry::release`] has been called.
    pub fn is_valid(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
    }

    fn ensure_valid(&self) -> Result<(), PollError> {
        if self.is_valid() {
            Ok(())
        } else {
            record_error(ErrorCode::InvalidArgument, "registry has been released");
            Err(PollError::InvalidState)
        }
    }

    /// Subscribes an endpoint for the given interests.
    ///
    /// `None` subscribes for every interest type. Re-adding an already
    /// subscribed endpoint replaces its mask.
    pub fn add_interest(
        &self,
        id: EndpointId,
        interest: Option<Interest>,
    ) -> Result<(), PollError> {
        self.ensure_valid()?;
        let fd = id.as_raw();
        if fd < 0 {
            record_error(ErrorCode::InvalidArgument, "negative endpoint descriptor");
            return Err(PollError::InvalidArgument(
                "negative endpoint descriptor".into(),
            ));
        }
        let interest = interest.unwrap_or(Interest::ALL);
        let mut inner = self.inner.lock();
        let sub = inner.subs.entry(id).or_insert(Subscription {
            fd,
            interest,
            reported: Interest::NONE,
        });
        sub.interest = interest;
        sub.reported = sub.reported.intersection(interest);
        Ok(())
    }

    /// Changes an existing subscription's interests.
    ///
    /// Behaves identically to [`Registry::add_interest`]: the subscription is
    /// upserted either way. The separate name documents intent at call sites.
    pub fn update_interest(
        &self,
        id: EndpointId,
        interest: Option<Interest>,
    ) -> Result<(), PollError> {
        self.add_interest(id, interest)
    }

    /// Unsubscribes an endpoint. Removing an endpoint that was never
    /// subscribed is a silent no-op.
    pub fn remove_interest(&self, id: EndpointId) -> Result<(), PollError> {
        self.ensure_valid()?;
        self.inner.lock().subs.remove(&id);
        Ok(())
    }

    /// Removes every subscription. Safe to call concurrently with a wait in
    /// progress; events for removed subscriptions are dropped on the way out.
    pub fn clear_all(&self) -> Result<(), PollError> {
        self.ensure_valid()?;
        self.inner.lock().subs.clear();
        Ok(())
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> Result<usize, PollError> {
        self.ensure_valid()?;
        Ok(self.inner.lock().subs.len())
    }

    /// Replaces the behavior flags, returning the previous set.
    pub fn set_flags(&self, flags: RegistryFlags) -> Result<RegistryFlags, PollError> {
        self.ensure_valid()?;
        Ok(std::mem::replace(&mut *self.flags.lock(), flags))
    }

    /// The current behavior flags.
    pub fn flags(&self) -> Result<RegistryFlags, PollError> {
        self.ensure_valid()?;
        Ok(*self.flags.lock())
    }

    /// Releases the registry. Every later operation, including a second
    /// release, fails with [`PollError::InvalidState`].
    pub fn release(&self) -> Result<(), PollError> {
        self.ensure_valid()?;
        self.inner.lock().subs.clear();
        self.released.store(true, Ordering::SeqCst);
        trace!(registry = self.id, "registry released");
        Ok(())
    }

    /// Blocks until a subscribed endpoint is ready, returning one partial
    /// batch of (read-ready, write-ready) endpoint ids.
    ///
    /// `expected_read`/`expected_write` are capacity hints, not hard limits:
    /// when more endpoints are ready than hinted the call returns a partial
    /// batch and the caller re-invokes to drain the remainder. A rotation
    /// cursor guarantees successive partial batches make progress through the
    /// ready set. Endpoints ready with an error appear in both buckets.
    ///
    /// `timeout_ms < 0` blocks indefinitely.
    pub fn wait(
        &self,
        timeout_ms: i64,
        expected_read: usize,
        expected_write: usize,
    ) -> Result<(Vec<EndpointId>, Vec<EndpointId>), PollError> {
        let cap = expected_read.saturating_add(expected_write);
        let (_, batch) = self.poll_once(timeout_ms, cap)?;
        let mut read_ready = Vec::new();
        let mut write_ready = Vec::new();
        for event in batch {
            if event.readiness.intersects(Interest::READ | Interest::ERROR) {
                read_ready.push(event.id);
            }
            if event.readiness.intersects(Interest::WRITE | Interest::ERROR) {
                write_ready.push(event.id);
            }
        }
        Ok((read_ready, write_ready))
    }

    /// Blocks until a subscribed endpoint is ready, returning the full set of
    /// readiness events with the satisfied interests per endpoint.
    ///
    /// Unlike [`Registry::wait`], this drains internally: when the reported
    /// ready total exceeds `expected_events`, it keeps pulling batches until
    /// the whole ready set has been collected, merging duplicates by id.
    pub fn wait_detailed(
        &self,
        timeout_ms: i64,
        expected_events: usize,
    ) -> Result<Vec<ReadyEvent>, PollError> {
        let cap = expected_events.max(1);
        let mut merged: Vec<ReadyEvent> = Vec::new();
        let mut slice = timeout_ms;
        loop {
            let (total, batch) = match self.poll_once(slice, cap) {
                Ok(result) => result,
                // A drain round can time out when readiness was consumed
                // between batches; keep what was already collected.
                Err(PollError::Timeout) if !merged.is_empty() => break,
                Err(e) => return Err(e),
            };
            let before = merged.len();
            for event in batch {
                match merged.iter_mut().find(|m| m.id == event.id) {
                    Some(existing) => existing.readiness |= event.readiness,
                    None => merged.push(event),
                }
            }
            if total <= cap || merged.len() >= total || merged.len() == before {
                break;
            }
            // The remainder is already ready; later rounds must not block.
            slice = 0;
        }
        Ok(merged)
    }

    /// One bounded wait returning `(total_ready, batch)` where the batch is
    /// capped at `cap` events selected round-robin from the ready set.
    fn poll_once(
        &self,
        timeout_ms: i64,
        cap: usize,
    ) -> Result<(usize, Vec<ReadyEvent>), PollError> {
        self.ensure_valid()?;
        let cap = cap.max(1);

        self.rearm_edge_triggered();

        let (snapshot, cursor) = {
            let inner = self.inner.lock();
            if inner.subs.is_empty() && !self.flags.lock().allow_empty {
                record_error(
                    ErrorCode::EmptySet,
                    "wait on a registry with no subscriptions",
                );
                return Err(PollError::EmptySet);
            }
            let snapshot: Vec<SubSnapshot> = inner
                .subs
                .iter()
                .map(|(id, sub)| SubSnapshot {
                    id: *id,
                    fd: sub.fd,
                    interest: sub.interest,
                    reported: sub.reported,
                })
                .collect();
            (snapshot, inner.cursor)
        };

        let mut fds: Vec<libc::pollfd> = snapshot
            .iter()
            .map(|sub| libc::pollfd {
                fd: sub.fd,
                events: poll_events(sub.interest.types().without(sub.reported)),
                revents: 0,
            })
            .collect();

        let check_output = self.flags.lock().check_output;
        let returned = if check_output && timeout_ms != 0 {
            let probe = poll_fds(&mut fds, 0);
            if probe > 0 {
                probe
            } else {
                poll_fds(&mut fds, timeout_ms)
            }
        } else {
            poll_fds(&mut fds, timeout_ms)
        };

        if returned < 0 {
            let os_error = std::io::Error::last_os_error();
            if os_error.raw_os_error() == Some(libc::EINTR) {
                record_error(ErrorCode::Timeout, "wait interrupted");
                return Err(PollError::Timeout);
            }
            record_error(ErrorCode::InvalidArgument, os_error.to_string());
            return Err(PollError::InvalidArgument(os_error.to_string()));
        }
        if returned == 0 {
            record_error(ErrorCode::Timeout, "wait timed out with no ready endpoint");
            return Err(PollError::Timeout);
        }

        let mut ready = Vec::new();
        for (sub, pollfd) in snapshot.iter().zip(fds.iter()) {
            let readiness = revents_to_interest(pollfd.revents)
                .intersection(sub.interest.types())
                .without(sub.reported);
            if !readiness.is_empty() {
                ready.push(ReadyEvent {
                    id: sub.id,
                    readiness,
                });
            }
        }

        let total = ready.len();
        if total == 0 {
            record_error(ErrorCode::Timeout, "wait timed out with no ready endpoint");
            return Err(PollError::Timeout);
        }

        let batch: Vec<ReadyEvent> = if total > cap {
            let start = cursor % total;
            (0..cap).map(|i| ready[(start + i) % total]).collect()
        } else {
            ready
        };

        // Record delivery under the lock; drop events whose subscription was
        // removed while the wait was in flight.
        let mut inner = self.inner.lock();
        inner.cursor = inner.cursor.wrapping_add(batch.len());
        let batch: Vec<ReadyEvent> = batch
            .into_iter()
            .filter(|event| match inner.subs.get_mut(&event.id) {
                Some(sub) => {
                    if sub.interest.is_edge_triggered() {
                        sub.reported |= event.readiness;
                    }
                    true
                }
                None => false,
            })
            .collect();

        if batch.is_empty() {
            record_error(ErrorCode::Timeout, "ready set cleared during wait");
            return Err(PollError::Timeout);
        }
        trace!(registry = self.id, total, returned = batch.len(), "readiness batch");
        Ok((total, batch))
    }

    /// Clears edge-trigger suppression for interests that are no longer
    /// satisfied, so the next not-ready → ready transition reports again.
    fn rearm_edge_triggered(&self) {
        let suppressed: Vec<(EndpointId, RawFd, Interest)> = {
            let inner = self.inner.lock();
            inner
                .subs
                .iter()
                .filter(|(_, sub)| !sub.reported.is_empty())
                .map(|(id, sub)| (*id, sub.fd, sub.reported))
                .collect()
        };
        if suppressed.is_empty() {
            return;
        }

        let mut fds: Vec<libc::pollfd> = suppressed
            .iter()
            .map(|(_, fd, reported)| libc::pollfd {
                fd: *fd,
                events: poll_events(*reported),
                revents: 0,
            })
            .collect();
        if poll_fds(&mut fds, 0) < 0 {
            return;
        }

        let mut inner = self.inner.lock();
        for ((id, _, _), pollfd) in suppressed.iter().zip(fds.iter()) {
            if let Some(sub) = inner.subs.get_mut(id) {
                let still_ready = revents_to_interest(pollfd.revents);
                sub.reported = sub.reported.intersection(still_ready);
            }
        }
    }
}

impl PartialEq for Registry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Registry {}

fn poll_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.contains(Interest::READ) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::WRITE) {
        events |= libc::POLLOUT;
    }
    events
}

fn revents_to_interest(revents: libc::c_short) -> Interest {
    let mut readiness = Interest::NONE;
    if revents & libc::POLLIN != 0 {
        readiness |= Interest::READ;
    }
    if revents & libc::POLLOUT != 0 {
        readiness |= Interest::WRITE;
    }
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        readiness |= Interest::ERROR;
    }
    readiness
}

fn poll_fds(fds: &mut [libc::pollfd], timeout_ms: i64) -> libc::c_int {
    let timeout = if timeout_ms < 0 {
        -1
    } else {
        timeout_ms.min(libc::c_int::MAX as i64) as libc::c_int
    };
    let ptr = if fds.is_empty() {
        ptr::null_mut()
    } else {
        fds.as_mut_ptr()
    };
    unsafe { libc::poll(ptr, fds.len() as libc::nfds_t, timeout) }
}

/// Scoped wrapper guaranteeing `clear_all` + `release` on every exit path,
/// including panics and early returns.
pub struct RegistryGuard {
    registry: Arc<Registry>,
}

impl RegistryGuard {
    pub fn new(registry: Arc<Registry>) -> Self {
        RegistryGuard { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        // Both calls fail only if the registry was already released.
        let _ = self.registry.clear_all();
        let _ = self.registry.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::last_error::{clear_last_error, last_error};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    fn id_of(stream: &TcpStream) -> EndpointId {
        EndpointId::from_raw(stream.as_raw_fd())
    }

    #[test]
    fn test_create_and_release() {
        let registry = Registry::new().unwrap();
        assert!(registry.is_valid());
        registry.release().unwrap();
        assert!(!registry.is_valid());
        assert_eq!(registry.release(), Err(PollError::InvalidState));
    }

    #[test]
    fn test_operations_fail_after_release() {
        let registry = Registry::new().unwrap();
        registry.release().unwrap();
        let id = EndpointId::from_raw(0);
        assert_eq!(registry.add_interest(id, None), Err(PollError::InvalidState));
        assert_eq!(registry.clear_all(), Err(PollError::InvalidState));
        assert_eq!(
            registry.set_flags(RegistryFlags::default()),
            Err(PollError::InvalidState)
        );
        assert!(matches!(
            registry.wait_detailed(10, 2),
            Err(PollError::InvalidState)
        ));
    }

    #[test]
    fn test_add_update_remove() {
        let registry = Registry::new().unwrap();
        let (client, _server) = tcp_pair();
        let id = id_of(&client);

        registry.add_interest(id, Some(Interest::ERROR)).unwrap();
        assert_eq!(registry.subscription_count().unwrap(), 1);

        // Re-adding and updating both replace the mask.
        registry
            .add_interest(id, Some(Interest::ERROR | Interest::EDGE_TRIGGERED))
            .unwrap();
        registry.update_interest(id, Some(Interest::READ)).unwrap();
        assert_eq!(registry.subscription_count().unwrap(), 1);

        registry.remove_interest(id).unwrap();
        assert_eq!(registry.subscription_count().unwrap(), 0);

        // Removing an unsubscribed endpoint is a silent no-op.
        registry.remove_interest(id).unwrap();
        registry.release().unwrap();
    }

    #[test]
    fn test_rejects_negative_descriptor() {
        let registry = Registry::new().unwrap();
        assert!(matches!(
            registry.add_interest(EndpointId::from_raw(-1), None),
            Err(PollError::InvalidArgument(_))
        ));
        registry.release().unwrap();
    }

    #[test]
    fn test_wait_empty_set_rejected() {
        clear_last_error();
        let registry = Registry::new().unwrap();
        assert_eq!(registry.wait_detailed(100, 2), Err(PollError::EmptySet));
        assert_eq!(last_error().code, ErrorCode::EmptySet);
        registry.release().unwrap();
    }

    #[test]
    fn test_wait_timeout_with_allow_empty() {
        clear_last_error();
        let registry = Registry::new().unwrap();
        registry
            .set_flags(RegistryFlags {
                allow_empty: true,
                check_output: false,
            })
            .unwrap();
        let start = std::time::Instant::now();
        assert_eq!(registry.wait(100, 2, 2), Err(PollError::Timeout));
        assert!(start.elapsed() >= std::time::Duration::from_millis(100));
        assert_eq!(last_error().code, ErrorCode::Timeout);
        registry.release().unwrap();
    }

    #[test]
    fn test_set_flags_returns_previous() {
        let registry = Registry::new().unwrap();
        assert_eq!(registry.flags().unwrap(), RegistryFlags::default());

        let first = RegistryFlags {
            allow_empty: true,
            check_output: false,
        };
        let second = RegistryFlags {
            allow_empty: true,
            check_output: true,
        };
        assert_eq!(registry.set_flags(first).unwrap(), RegistryFlags::default());
        assert_eq!(registry.set_flags(second).unwrap(), first);
        assert_eq!(registry.flags().unwrap(), second);
        registry.release().unwrap();
    }

    #[test]
    fn test_write_readiness() {
        let registry = Registry::new().unwrap();
        let (client, _server) = tcp_pair();
        let id = id_of(&client);

        registry
            .add_interest(id, Some(Interest::WRITE | Interest::ERROR))
            .unwrap();
        let events = registry.wait_detailed(1000, 2).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
        assert!(events[0].readiness.contains(Interest::WRITE));
        registry.release().unwrap();
    }

    #[test]
    fn test_read_readiness_after_send() {
        let registry = Registry::new().unwrap();
        let (client, server) = tcp_pair();
        let id = id_of(&client);

        registry.add_interest(id, Some(Interest::READ)).unwrap();
        assert_eq!(registry.wait_detailed(50, 2), Err(PollError::Timeout));

        (&server).write_all(b"ping").unwrap();
        let events = registry.wait_detailed(1000, 2).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].readiness.contains(Interest::READ));
        registry.release().unwrap();
    }

    #[test]
    fn test_partial_batches_rotate_through_ready_set() {
        let registry = Registry::new().unwrap();
        let pairs: Vec<_> = (0..3).map(|_| tcp_pair()).collect();
        for (client, server) in &pairs {
            registry
                .add_interest(id_of(client), Some(Interest::READ))
                .unwrap();
            (&*server).write_all(b"x").unwrap();
        }

        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..3 {
            let (read_ready, write_ready) = registry.wait(1000, 1, 0).unwrap();
            assert_eq!(read_ready.len(), 1);
            assert!(write_ready.is_empty());
            seen.insert(read_ready[0]);
        }
        assert_eq!(seen.len(), 3);
        registry.release().unwrap();
    }

    #[test]
    fn test_wait_detailed_drains_past_capacity_hint() {
        let registry = Registry::new().unwrap();
        let pairs: Vec<_> = (0..3).map(|_| tcp_pair()).collect();
        for (client, server) in &pairs {
            registry
                .add_interest(id_of(client), Some(Interest::READ))
                .unwrap();
            (&*server).write_all(b"x").unwrap();
        }

        let events = registry.wait_detailed(1000, 1).unwrap();
        assert_eq!(events.len(), 3);
        let unique: std::collections::BTreeSet<_> = events.iter().map(|e| e.id).collect();
        assert_eq!(unique.len(), 3);
        registry.release().unwrap();
    }

    #[test]
    fn test_level_triggered_reports_repeatedly() {
        let registry = Registry::new().unwrap();
        let (client, server) = tcp_pair();
        registry
            .add_interest(id_of(&client), Some(Interest::READ))
            .unwrap();
        (&server).write_all(b"data").unwrap();

        for _ in 0..2 {
            let events = registry.wait_detailed(1000, 2).unwrap();
            assert!(events[0].readiness.contains(Interest::READ));
        }
        registry.release().unwrap();
    }

    #[test]
    fn test_edge_triggered_reports_on_transitions_only() {
        let registry = Registry::new().unwrap();
        let (mut client, server) = tcp_pair();
        let id = id_of(&client);
        registry
            .add_interest(id, Some(Interest::READ | Interest::EDGE_TRIGGERED))
            .unwrap();

        (&server).write_all(b"one").unwrap();
        let events = registry.wait_detailed(1000, 2).unwrap();
        assert!(events[0].readiness.contains(Interest::READ));

        // Still ready, but already reported: suppressed until readiness drops.
        assert_eq!(registry.wait_detailed(50, 2), Err(PollError::Timeout));

        // Drain the socket, then produce a fresh transition.
        let mut buf = [0u8; 16];
        client.read(&mut buf).unwrap();
        assert_eq!(registry.wait_detailed(50, 2), Err(PollError::Timeout));

        (&server).write_all(b"two").unwrap();
        let events = registry.wait_detailed(1000, 2).unwrap();
        assert!(events[0].readiness.contains(Interest::READ));
        registry.release().unwrap();
    }

    #[test]
    fn test_clear_all_empties_subscriptions() {
        let registry = Registry::new().unwrap();
        let (client, _server) = tcp_pair();
        registry.add_interest(id_of(&client), None).unwrap();
        assert_eq!(registry.subscription_count().unwrap(), 1);

        registry.clear_all().unwrap();
        assert_eq!(registry.subscription_count().unwrap(), 0);
        assert_eq!(registry.wait_detailed(10, 2), Err(PollError::EmptySet));
        registry.release().unwrap();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let registry = Arc::new(Registry::new().unwrap());
        let (client, _server) = tcp_pair();
        {
            let guard = RegistryGuard::new(registry.clone());
            guard
                .registry()
                .add_interest(id_of(&client), Some(Interest::READ))
                .unwrap();
        }
        assert!(!registry.is_valid());
    }
}
