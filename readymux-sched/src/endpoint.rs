//! Asynchronous endpoint orchestrator.
//!
//! [`AsyncEndpoint`] wraps a non-blocking [`Endpoint`] and drives every
//! operation through a fresh readiness registry on a single worker thread.
//! Each operation is a pending request with exactly one resolution; a
//! background monitor models the out-of-band connection-loss callback of the
//! underlying transport.

use crate::cancel::CancelToken;
use crate::completion::Completion;
use crate::op::{Direction, OpCanceller, OpError, OpHandle};
use bytes::{Bytes, BytesMut};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use readymux_net::{Endpoint, EndpointState, LossEvent, Progress, SocketOption, SocketOptionKey};
use readymux_poll::{
    clear_last_error, last_error, EndpointId, ErrorCode, Interest, PollError, Registry,
    RegistryGuard,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Bounded wait used for each poll slice, independent of the caller's
/// overall deadline, so cancellation is observed promptly.
const POLL_SLICE: Duration = Duration::from_millis(100);
/// Probe cadence of the connection-loss monitor.
const MONITOR_SLICE: Duration = Duration::from_millis(100);
/// Capacity hint handed to the registry wait.
const EXPECTED_EVENTS: usize = 2;

type Job = Box<dyn FnOnce() + Send>;

struct Shared {
    endpoint: Arc<Endpoint>,
    jobs: Sender<Job>,
    context: Arc<Completion<Result<(), OpError>>>,
    has_been_connected: AtomicBool,
    broken: AtomicBool,
    closed: AtomicBool,
    /// Per-direction slot holding the id of the outstanding operation, 0 when
    /// free. Claimed at submission, released by whichever of the worker or a
    /// cancellation path gets there first.
    busy: [Arc<AtomicU64>; 2],
    active: Mutex<Vec<OpCanceller>>,
    monitor_armed: AtomicBool,
    next_op_id: AtomicU64,
}

impl Shared {
    fn handle_loss(&self, event: LossEvent) {
        if !self.has_been_connected.load(Ordering::SeqCst)
            || self.closed.load(Ordering::SeqCst)
        {
            return;
        }
        self.broken.store(true, Ordering::SeqCst);
        debug!(code = %event.code, "connection lost");
        let error = OpError::Transport {
            code: event.code,
            message: event.message,
        };
        self.context.resolve(Err(error.clone()));
        self.fail_children(error);
    }

    fn fail_children(&self, error: OpError) {
        let ops: Vec<OpCanceller> = self.active.lock().drain(..).collect();
        for op in ops {
            op.fail_with(error.clone());
        }
    }
}

/// Coroutine-style endpoint: asynchronous connect/accept/send/receive over a
/// non-blocking handle, serialized on one worker.
///
/// Cloning shares the same underlying endpoint and worker. At most one
/// operation per direction may be outstanding at a time; reads and writes
/// are independent directions and may overlap.
#[derive(Clone)]
pub struct AsyncEndpoint {
    shared: Arc<Shared>,
}

impl AsyncEndpoint {
    /// Creates a new endpoint managed by its own scheduler worker.
    pub fn new(ipv6: bool) -> Result<Self, OpError> {
        Self::from_endpoint(Endpoint::new(ipv6)?)
    }

    fn from_endpoint(endpoint: Endpoint) -> Result<Self, OpError> {
        let (jobs, job_rx) = unbounded::<Job>();
        let shared = Arc::new(Shared {
            endpoint: Arc::new(endpoint),
            jobs,
            context: Arc::new(Completion::new()),
            has_been_connected: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            busy: [Arc::new(AtomicU64::new(0)), Arc::new(AtomicU64::new(0))],
            active: Mutex::new(Vec::new()),
            monitor_armed: AtomicBool::new(false),
            next_op_id: AtomicU64::new(1),
        });
        thread::Builder::new()
            .name("readymux-worker".into())
            .spawn(move || {
                for job in job_rx {
                    job();
                }
            })
            .map_err(|e| OpError::Resource(e.to_string()))?;
        Ok(AsyncEndpoint { shared })
    }

    /// The registry token of the underlying endpoint.
    pub fn id(&self) -> EndpointId {
        self.shared.endpoint.id()
    }

    /// Current state of the underlying endpoint.
    pub fn state(&self) -> EndpointState {
        self.shared.endpoint.state()
    }

    /// Lifetime signal: resolves `Ok` on local close, `Err` with a transport
    /// error when an established connection is lost out of band.
    pub fn context(&self) -> Arc<Completion<Result<(), OpError>>> {
        self.shared.context.clone()
    }

    /// The local address the endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, OpError> {
        Ok(self.shared.endpoint.local_addr()?)
    }

    /// The remote address the endpoint is connected to.
    pub fn peer_addr(&self) -> Result<SocketAddr, OpError> {
        Ok(self.shared.endpoint.peer_addr()?)
    }

    /// Sets a socket option.
    pub fn set_option(&self, option: SocketOption) -> Result<(), OpError> {
        Ok(self.shared.endpoint.set_option(option)?)
    }

    /// Reads a socket option.
    pub fn get_option(&self, key: SocketOptionKey) -> Result<SocketOption, OpError> {
        Ok(self.shared.endpoint.get_option(key)?)
    }

    /// Binds to a local address and arms loss monitoring.
    pub fn bind(&self, addr: SocketAddr) -> Result<(), OpError> {
        self.shared.endpoint.bind(addr)?;
        mark_connected(&self.shared);
        Ok(())
    }

    /// Starts listening for incoming connections.
    pub fn listen(&self, backlog: i32) -> Result<(), OpError> {
        self.shared.endpoint.listen(backlog)?;
        Ok(())
    }

    /// Asynchronously connects to a remote address.
    ///
    /// The connection attempt is issued before the first wait; the operation
    /// resolves once write readiness confirms (or refutes) establishment.
    pub fn connect(&self, addr: SocketAddr) -> OpHandle<()> {
        let shared = self.shared.clone();
        self.submit(
            Direction::Write,
            Interest::WRITE,
            None,
            move |endpoint: &Endpoint| {
                endpoint.try_connect(addr)?;
                Ok(())
            },
            move |endpoint: &Endpoint| match endpoint.finish_connect()? {
                Progress::Ready(()) => {
                    mark_connected(&shared);
                    Ok(Progress::Ready(()))
                }
                Progress::WouldBlock => Ok(Progress::WouldBlock),
            },
        )
    }

    /// Asynchronously accepts one incoming connection, returning a new
    /// scheduler-managed endpoint and the peer address.
    pub fn accept(&self) -> OpHandle<(AsyncEndpoint, SocketAddr)> {
        self.submit(
            Direction::Read,
            Interest::READ,
            None,
            |_| Ok(()),
            |endpoint| match endpoint.try_accept()? {
                Progress::Ready((accepted, peer)) => {
                    let accepted = AsyncEndpoint::from_endpoint(accepted)?;
                    mark_connected(&accepted.shared);
                    Ok(Progress::Ready((accepted, peer)))
                }
                Progress::WouldBlock => Ok(Progress::WouldBlock),
            },
        )
    }

    /// Asynchronously sends bytes, resolving with the count actually taken
    /// by the transport. A partial count is a success.
    ///
    /// The overall deadline comes from the `SendTimeout` option.
    pub fn send(&self, data: Bytes) -> OpHandle<usize> {
        let deadline = self.option_deadline(SocketOptionKey::SendTimeout);
        self.submit(
            Direction::Write,
            Interest::WRITE,
            deadline,
            |_| Ok(()),
            move |endpoint| Ok(endpoint.try_send(&data)?),
        )
    }

    /// Asynchronously receives up to `len` bytes.
    ///
    /// The overall deadline comes from the `ReceiveTimeout` option.
    pub fn recv(&self, len: usize) -> OpHandle<Bytes> {
        let deadline = self.option_deadline(SocketOptionKey::ReceiveTimeout);
        let mut buf = vec![0u8; len];
        self.submit(
            Direction::Read,
            Interest::READ,
            deadline,
            |_| Ok(()),
            move |endpoint| match endpoint.try_recv(&mut buf)? {
                Progress::Ready(n) => Ok(Progress::Ready(Bytes::copy_from_slice(&buf[..n]))),
                Progress::WouldBlock => Ok(Progress::WouldBlock),
            },
        )
    }

    /// Sends the whole buffer, chaining operations until every byte has been
    /// taken. Blocks the calling thread between operations.
    pub fn send_all(&self, data: Bytes) -> Result<usize, OpError> {
        let mut sent = 0;
        while sent < data.len() {
            sent += self.send(data.slice(sent..)).join()?;
        }
        Ok(sent)
    }

    /// Receives exactly `len` bytes, chaining operations until the buffer is
    /// full. Blocks the calling thread between operations.
    pub fn recv_exact(&self, len: usize) -> Result<Bytes, OpError> {
        let mut collected = BytesMut::with_capacity(len);
        while collected.len() < len {
            let chunk = self.recv(len - collected.len()).join()?;
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.freeze())
    }

    /// Closes the endpoint: cancels in-flight operations, closes the handle
    /// exactly once, and completes the lifetime context.
    pub fn close(&self) -> Result<(), OpError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.fail_children(OpError::Cancelled);
        self.shared.endpoint.close()?;
        self.shared.context.resolve(Ok(()));
        Ok(())
    }

    fn option_deadline(&self, key: SocketOptionKey) -> Option<Duration> {
        match self.shared.endpoint.get_option(key) {
            Ok(SocketOption::SendTimeout(timeout)) => timeout,
            Ok(SocketOption::ReceiveTimeout(timeout)) => timeout,
            _ => None,
        }
    }

    /// Schedules one pending operation on the worker.
    ///
    /// `prepare` issues the non-blocking call that puts the operation in
    /// flight before the first wait; `action` runs once the requested
    /// readiness is reported and produces the resolution value.
    fn submit<T, P, A>(
        &self,
        direction: Direction,
        interest: Interest,
        deadline: Option<Duration>,
        prepare: P,
        mut action: A,
    ) -> OpHandle<T>
    where
        T: Send + 'static,
        P: FnOnce(&Endpoint) -> Result<(), OpError> + Send + 'static,
        A: FnMut(&Endpoint) -> Result<Progress<T>, OpError> + Send + 'static,
    {
        let completion = Arc::new(Completion::new());
        let token = CancelToken::new();
        let registry_slot = Arc::new(Mutex::new(None));
        let op_id = self.shared.next_op_id.fetch_add(1, Ordering::Relaxed);
        let busy_slot = self.shared.busy[direction.index()].clone();
        let canceller = OpCanceller {
            op_id,
            token: token.clone(),
            registry: registry_slot.clone(),
            busy: busy_slot.clone(),
            completion: {
                let completion = completion.clone();
                Arc::new(move |error: OpError| completion.resolve(Err(error)))
            },
        };
        let handle = OpHandle {
            completion: completion.clone(),
            canceller: canceller.clone(),
        };

        if self.shared.closed.load(Ordering::SeqCst) {
            completion.resolve(Err(OpError::InvalidArgument("endpoint is closed".into())));
            return handle;
        }
        if self.shared.broken.load(Ordering::SeqCst) {
            completion.resolve(Err(OpError::Transport {
                code: ErrorCode::ConnLost,
                message: "connection lost".into(),
            }));
            return handle;
        }
        if busy_slot
            .compare_exchange(0, op_id, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            completion.resolve(Err(OpError::InvalidArgument(format!(
                "a {:?} operation is already outstanding",
                direction
            ))));
            return handle;
        }
        self.shared.active.lock().push(canceller.clone());

        let shared = self.shared.clone();
        let worker_completion = completion.clone();
        let worker_canceller = canceller.clone();
        let job: Job = Box::new(move || {
            let result = if shared.closed.load(Ordering::SeqCst) {
                Err(OpError::Cancelled)
            } else {
                execute(
                    &shared,
                    interest,
                    deadline,
                    prepare,
                    &mut action,
                    &token,
                    &registry_slot,
                )
            };
            match &result {
                Ok(_) => trace!(op_id, "operation resolved"),
                Err(e) => trace!(op_id, error = %e, "operation failed"),
            }
            worker_completion.resolve(result);
            worker_canceller.release_slot();
            shared.active.lock().retain(|op| op.op_id != op_id);
        });
        if self.shared.jobs.send(job).is_err() {
            completion.resolve(Err(OpError::Resource("scheduler worker is gone".into())));
            canceller.release_slot();
            self.shared.active.lock().retain(|op| op.op_id != op_id);
        }
        handle
    }
}

/// Marks the endpoint as having been connected and arms the loss monitor.
fn mark_connected(shared: &Arc<Shared>) {
    shared.has_been_connected.store(true, Ordering::SeqCst);
    if !shared.monitor_armed.swap(true, Ordering::SeqCst) {
        let weak = Arc::downgrade(shared);
        let losses = shared.endpoint.loss_events();
        let spawned = thread::Builder::new()
            .name("readymux-monitor".into())
            .spawn(move || monitor_loop(weak, losses));
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn connection monitor");
        }
    }
}

/// Watches for out-of-band connection loss: consumes the endpoint's loss
/// channel and runs a non-destructive liveness probe each slice. Exits once
/// a loss has been delivered, the endpoint closes, or the scheduler is gone.
fn monitor_loop(weak: Weak<Shared>, losses: Receiver<LossEvent>) {
    loop {
        match losses.recv_timeout(MONITOR_SLICE) {
            Ok(event) => {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_loss(event);
                }
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
                // A failed probe publishes a loss event, picked up next round.
                let _ = shared.endpoint.probe_liveness();
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Runs one pending operation: scoped registry, readiness loop, resolution.
fn execute<T, P, A>(
    shared: &Arc<Shared>,
    interest: Interest,
    deadline: Option<Duration>,
    prepare: P,
    action: &mut A,
    token: &CancelToken,
    registry_slot: &Arc<Mutex<Option<Arc<Registry>>>>,
) -> Result<T, OpError>
where
    P: FnOnce(&Endpoint) -> Result<(), OpError>,
    A: FnMut(&Endpoint) -> Result<Progress<T>, OpError>,
{
    clear_last_error();
    if token.is_cancelled() {
        return Err(OpError::Cancelled);
    }

    let registry = Arc::new(Registry::new().map_err(|e| OpError::Resource(e.to_string()))?);
    *registry_slot.lock() = Some(registry.clone());
    // Guarantees clear_all + release on every exit path below.
    let guard = RegistryGuard::new(registry);

    let endpoint = &*shared.endpoint;
    let id = endpoint.id();
    let subscription = interest | Interest::ERROR;

    guard.registry().add_interest(id, Some(subscription))?;
    prepare(endpoint)?;

    let started = Instant::now();
    loop {
        if token.is_cancelled() {
            return Err(OpError::Cancelled);
        }
        let slice = match deadline {
            Some(limit) => {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    return Err(OpError::Timeout);
                }
                POLL_SLICE.min(limit - elapsed)
            }
            None => POLL_SLICE,
        };

        let events = match guard
            .registry()
            .wait_detailed(slice.as_millis() as i64, EXPECTED_EVENTS)
        {
            Ok(events) => events,
            // The internal slice elapsed: a heartbeat, not a failure.
            Err(PollError::Timeout) if last_error().code == ErrorCode::Timeout => continue,
            Err(PollError::Timeout) => return Err(OpError::Unknown),
            Err(e) => return Err(e.into()),
        };

        let Some(event) = events.into_iter().find(|ev| ev.id == id) else {
            // Spurious wake for some other endpoint.
            continue;
        };
        // Stop further wake-ups while the result is being processed.
        guard.registry().remove_interest(id)?;

        if event.readiness.contains(Interest::ERROR) {
            return Err(error_readiness(endpoint));
        }
        if event.readiness.intersects(interest) {
            match action(endpoint)? {
                Progress::Ready(value) => return Ok(value),
                // The readiness report went stale before the call; re-arm.
                Progress::WouldBlock => {
                    guard.registry().add_interest(id, Some(subscription))?;
                    continue;
                }
            }
        } else {
            guard.registry().add_interest(id, Some(subscription))?;
        }
    }
}

/// Triage for an error-readiness event, in order: broken endpoint, pending
/// socket error, recorded last error, liveness probe, otherwise unclassified.
fn error_readiness(endpoint: &Endpoint) -> OpError {
    if endpoint.state() == EndpointState::Broken {
        let last = last_error();
        let (code, message) = if last.code == ErrorCode::Success {
            (ErrorCode::ConnLost, "endpoint is broken".to_string())
        } else {
            (last.code, last.message)
        };
        return OpError::Transport { code, message };
    }
    if let Some((code, message)) = endpoint.probe_error() {
        return OpError::Transport { code, message };
    }
    let last = last_error();
    if last.code != ErrorCode::Success {
        return OpError::Transport {
            code: last.code,
            message: last.message,
        };
    }
    // Hang-up without a pending socket error: a failed probe records the
    // teardown into the last-error slot.
    if !endpoint.probe_liveness() {
        let last = last_error();
        return OpError::Transport {
            code: last.code,
            message: last.message,
        };
    }
    OpError::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Server listening plus a fully established client/accepted pair.
    fn connected_pair() -> (AsyncEndpoint, AsyncEndpoint) {
        let server = AsyncEndpoint::new(false).unwrap();
        server.bind(ephemeral()).unwrap();
        server.listen(8).unwrap();
        let addr = server.local_addr().unwrap();

        let client = AsyncEndpoint::new(false).unwrap();
        let accepting = server.accept();
        client.connect(addr).join().unwrap();
        let (accepted, _peer) = accepting.join().unwrap();
        (client, accepted)
    }

    #[test]
    fn test_connect_accept() {
        let (client, accepted) = connected_pair();
        assert_eq!(client.state(), EndpointState::Connected);
        assert_eq!(accepted.state(), EndpointState::Connected);
        assert_eq!(
            client.peer_addr().unwrap(),
            accepted.local_addr().unwrap()
        );
    }

    #[test]
    fn test_send_recv() {
        let (client, accepted) = connected_pair();
        let sent = client.send(Bytes::from_static(b"ready")).join().unwrap();
        assert_eq!(sent, 5);

        let received = accepted.recv(16).join().unwrap();
        assert_eq!(&received[..], b"ready");
    }

    #[test]
    fn test_recv_deadline_is_operation_timeout() {
        let (_client, accepted) = connected_pair();
        accepted
            .set_option(SocketOption::ReceiveTimeout(Some(Duration::from_millis(
                100,
            ))))
            .unwrap();

        let started = Instant::now();
        let result = accepted.recv(8).join();
        let elapsed = started.elapsed();

        assert_eq!(result, Err(OpError::Timeout));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn test_same_direction_operations_rejected() {
        let (_client, accepted) = connected_pair();
        let first = accepted.recv(8);
        let second = accepted.recv(8);

        assert!(matches!(
            second.join(),
            Err(OpError::InvalidArgument(_))
        ));

        first.cancel();
        assert_eq!(first.join(), Err(OpError::Cancelled));
    }

    #[test]
    fn test_read_and_write_directions_overlap() {
        let (client, accepted) = connected_pair();
        // Both directions may be outstanding at once; the poll loops
        // themselves serialize on the worker.
        let pending_read = client.recv(8);
        let pending_write = client.send(Bytes::from_static(b"x"));

        accepted.send(Bytes::from_static(b"y")).join().unwrap();
        assert_eq!(&pending_read.join().unwrap()[..], b"y");
        assert_eq!(pending_write.join().unwrap(), 1);
        assert_eq!(&accepted.recv(8).join().unwrap()[..], b"x");
    }

    #[test]
    fn test_cancel_clears_subscriptions_before_release() {
        let (_client, accepted) = connected_pair();
        let pending = accepted.recv(8);

        // Wait for the worker to publish the registry and subscribe on it.
        let registry = {
            let deadline = Instant::now() + Duration::from_secs(1);
            loop {
                if let Some(registry) = pending.canceller.registry.lock().clone() {
                    if registry.subscription_count().unwrap() == 1 {
                        break registry;
                    }
                }
                assert!(Instant::now() < deadline, "operation never started");
                thread::sleep(Duration::from_millis(5));
            }
        };

        pending.cancel();
        // Subscriptions are gone the moment cancel returns; the registry
        // itself is released once the poll loop unwinds.
        match registry.subscription_count() {
            Ok(count) => assert_eq!(count, 0),
            Err(PollError::InvalidState) => {}
            Err(e) => panic!("unexpected registry error: {:?}", e),
        }
        assert_eq!(pending.join(), Err(OpError::Cancelled));

        let deadline = Instant::now() + Duration::from_secs(1);
        while registry.is_valid() {
            assert!(Instant::now() < deadline, "registry never released");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_cancel_then_reuse() {
        let (client, accepted) = connected_pair();
        let pending = accepted.recv(8);
        pending.cancel();
        assert_eq!(pending.join(), Err(OpError::Cancelled));

        client.send(Bytes::from_static(b"later")).join().unwrap();
        assert_eq!(&accepted.recv(8).join().unwrap()[..], b"later");
    }

    #[test]
    fn test_failing_action_still_releases_registry() {
        let (client, _accepted) = connected_pair();
        let handle = client.submit::<(), _, _>(
            Direction::Write,
            Interest::WRITE,
            None,
            |_| Ok(()),
            |_| {
                Err(OpError::Transport {
                    code: ErrorCode::SockFail,
                    message: "injected failure".into(),
                })
            },
        );
        let registry_slot = handle.canceller.registry.clone();
        assert!(matches!(handle.join(), Err(OpError::Transport { .. })));

        let registry = registry_slot.lock().clone().unwrap();
        assert!(!registry.is_valid());

        // The endpoint itself is unaffected: a fresh registry still sees it.
        let probe = Registry::new().unwrap();
        probe
            .add_interest(client.id(), Some(Interest::WRITE))
            .unwrap();
        let events = probe.wait_detailed(1000, 2).unwrap();
        assert!(events[0].readiness.contains(Interest::WRITE));
        probe.release().unwrap();
    }

    #[test]
    fn test_send_all_and_recv_exact() {
        let (client, accepted) = connected_pair();
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let expected = payload.clone();

        let sender = client.clone();
        let writer = std::thread::spawn(move || sender.send_all(Bytes::from(payload)));

        let received = accepted.recv_exact(4096).unwrap();
        assert_eq!(&received[..], &expected[..]);
        assert_eq!(writer.join().unwrap().unwrap(), 4096);
    }

    #[test]
    fn test_close_completes_context() {
        let (client, _accepted) = connected_pair();
        let context = client.context();
        client.close().unwrap();
        assert_eq!(context.wait(), Ok(()));
        assert_eq!(client.state(), EndpointState::Closed);

        // Operations after close fail fast.
        assert!(matches!(
            client.send(Bytes::from_static(b"late")).join(),
            Err(OpError::InvalidArgument(_))
        ));
    }
}
