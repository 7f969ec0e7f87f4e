//! Endpoint request/response engine.
//!
//! Multiplexes endpoint-addressed operations over a packet link. Every
//! request is tagged with a 16-bit sequence number and the device echoes
//! that number in its reply, so replies may arrive out of order and are
//! routed back to the right caller. One request is on the wire at a
//! time, with a single-slot queue behind it; a third concurrent invoke
//! is rejected with `Busy`.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐                         ┌─► Writer Task ─► PacketSink
//! Caller 2 ─┼─► EndpointProtocol ─► Engine Task
//! Caller N ─┘    (mpsc commands)      └─◄ RX Pump ◄─── PacketSource
//! ```
//!
//! The engine task owns all protocol state (sequence counter, TX slots,
//! expected-ack map). The writer task owns the sink, the RX pump owns
//! the source; each reports back over a capacity-1 channel. Operations
//! are registered under their sequence number before their packet
//! reaches the writer, so a reply that races its own request's write is
//! matched like any other; reply dispatch never waits on an in-flight
//! transmit. Only a new transmit is deferred while one is in flight:
//! promotion out of the pending slot happens on transmit completion.
//!
//! # Example
//!
//! ```ignore
//! use bytes::{Bytes, BytesMut};
//! use drivelink::{EndpointProtocol, EngineConfig};
//!
//! let (proto, stopped) = EndpointProtocol::over_stream(rx, tx, EngineConfig::default());
//! let invocation = proto
//!     .invoke(0x0001, Bytes::from_static(&[0xDE, 0xAD]), BytesMut::with_capacity(64))
//!     .await?;
//! let reply = invocation.finish().await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::error::{DrivelinkError, Result};
use crate::protocol::framer::{PacketUnwrapper, PacketWrapper};
use crate::protocol::wire::{decode_reply, RequestHeader, DEFAULT_MTU, REQUEST_HEADER_SIZE};
use crate::transport::{PacketSink, PacketSource};

/// Fixed size of the engine's receive scratch buffer; also the upper
/// bound on the configurable MTU.
pub const SCRATCH_SIZE: usize = 128;

/// Configuration for the endpoint engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Largest packet payload the link carries, including the 4-byte
    /// request prefix. Clamped to [`SCRATCH_SIZE`].
    pub mtu: usize,
    /// Capacity of the command channel between handles and the engine.
    pub command_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            command_capacity: 16,
        }
    }
}

/// Opaque token identifying an in-flight operation for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpHandle(u64);

type OpResult = Result<BytesMut>;

/// An endpoint operation while it lives inside the engine.
struct EndpointOperation {
    handle: OpHandle,
    seqno: u16,
    endpoint_id: u16,
    tx_payload: Bytes,
    rx_buf: BytesMut,
    done: Option<oneshot::Sender<OpResult>>,
}

impl EndpointOperation {
    /// Fire the completer. Exactly one completion wins; the rest are
    /// no-ops because the sender has been taken.
    fn complete(&mut self, result: OpResult) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

struct InvokeRequest {
    endpoint_id: u16,
    tx_payload: Bytes,
    rx_buf: BytesMut,
    handle: OpHandle,
    accepted: oneshot::Sender<Result<oneshot::Receiver<OpResult>>>,
}

enum Command {
    Invoke(InvokeRequest),
    Cancel(OpHandle),
}

/// An accepted endpoint operation.
///
/// Resolves exactly once via [`finish`](Invocation::finish); the
/// [`handle`](Invocation::handle) can be passed to
/// [`EndpointProtocol::cancel`] at any point before then.
#[derive(Debug)]
pub struct Invocation {
    handle: OpHandle,
    done: oneshot::Receiver<OpResult>,
}

impl Invocation {
    /// Token for cancelling this operation.
    pub fn handle(&self) -> OpHandle {
        self.handle
    }

    /// Wait for the operation to complete.
    ///
    /// Returns the caller's reply buffer filled with the received
    /// payload (clamped to the buffer's capacity), or the status the
    /// operation ended with.
    pub async fn finish(self) -> Result<BytesMut> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(DrivelinkError::Closed),
        }
    }
}

/// Resolves once when the engine stops, carrying the terminal reason.
pub struct Stopped(oneshot::Receiver<DrivelinkError>);

impl Stopped {
    /// Wait for the engine to stop.
    pub async fn wait(self) -> DrivelinkError {
        self.0.await.unwrap_or(DrivelinkError::Closed)
    }
}

/// Caller-facing handle to a running endpoint engine.
///
/// Cheap to clone; all clones feed the same engine. The engine shuts
/// down when the transport closes or when every handle is dropped.
#[derive(Clone)]
pub struct EndpointProtocol {
    cmd_tx: mpsc::Sender<Command>,
    next_handle: Arc<AtomicU64>,
}

impl EndpointProtocol {
    /// Start the engine over a packet link.
    ///
    /// Spawns the engine, writer, and receive-pump tasks. The returned
    /// [`Stopped`] future resolves exactly once when the engine
    /// terminates.
    pub fn start<S, R>(sink: S, source: R, config: EngineConfig) -> (Self, Stopped)
    where
        S: PacketSink + 'static,
        R: PacketSource + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity.max(1));
        let (jobs_tx, jobs_rx) = mpsc::channel(1);
        let (tx_done_tx, tx_done_rx) = mpsc::channel(1);
        let (rx_evt_tx, rx_evt_rx) = mpsc::channel(1);
        let (stopped_tx, stopped_rx) = oneshot::channel();

        tokio::spawn(writer_loop(sink, jobs_rx, tx_done_tx));
        tokio::spawn(rx_loop(source, rx_evt_tx));

        let engine = Engine {
            mtu: config.mtu.min(SCRATCH_SIZE),
            running: true,
            outbound_seqno: 0,
            transmitting: None,
            pending_op: None,
            expected_acks: HashMap::new(),
            jobs: Some(jobs_tx),
            on_stopped: Some(stopped_tx),
        };
        tokio::spawn(engine_loop(engine, cmd_rx, tx_done_rx, rx_evt_rx));

        (
            Self {
                cmd_tx,
                next_handle: Arc::new(AtomicU64::new(1)),
            },
            Stopped(stopped_rx),
        )
    }

    /// Start the engine over a raw byte stream by stacking the framer
    /// underneath.
    pub fn over_stream<R, W>(read: R, write: W, config: EngineConfig) -> (Self, Stopped)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(PacketWrapper::new(write), PacketUnwrapper::new(read), config)
    }

    /// Submit an endpoint operation.
    ///
    /// `tx_payload` plus the 4-byte request prefix must fit the MTU.
    /// The reply is written into `rx_buf`, clamped to its capacity, and
    /// handed back through the returned [`Invocation`].
    ///
    /// Rejected synchronously with `Busy` when a request is on the wire
    /// and the single pending slot is already taken, and with `Closed`
    /// once the engine has stopped.
    pub async fn invoke(
        &self,
        endpoint_id: u16,
        tx_payload: Bytes,
        rx_buf: BytesMut,
    ) -> Result<Invocation> {
        let handle = OpHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (accepted_tx, accepted_rx) = oneshot::channel();

        self.cmd_tx
            .send(Command::Invoke(InvokeRequest {
                endpoint_id,
                tx_payload,
                rx_buf,
                handle,
                accepted: accepted_tx,
            }))
            .await
            .map_err(|_| DrivelinkError::Closed)?;

        match accepted_rx.await {
            Ok(Ok(done)) => Ok(Invocation { handle, done }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(DrivelinkError::Closed),
        }
    }

    /// Cancel an in-flight operation.
    ///
    /// Best-effort and idempotent: if the operation is still pending,
    /// transmitting, or awaiting its reply, it resolves `Cancelled`.
    /// Bytes already committed to the wire still go out; cancellation
    /// removes the expectation of a reply.
    pub async fn cancel(&self, handle: OpHandle) {
        let _ = self.cmd_tx.send(Command::Cancel(handle)).await;
    }

    /// Invoke and wait, cancelling the operation if no reply arrives
    /// within `timeout`.
    pub async fn call(
        &self,
        endpoint_id: u16,
        tx_payload: Bytes,
        rx_buf: BytesMut,
        timeout: Duration,
    ) -> Result<BytesMut> {
        let invocation = self.invoke(endpoint_id, tx_payload, rx_buf).await?;
        let handle = invocation.handle();

        match tokio::time::timeout(timeout, invocation.finish()).await {
            Ok(result) => result,
            Err(_) => {
                self.cancel(handle).await;
                Err(DrivelinkError::Cancelled)
            }
        }
    }
}

/// Writer task: one packet on the wire at a time, outcome reported back
/// to the engine.
async fn writer_loop<S: PacketSink>(
    mut sink: S,
    mut jobs: mpsc::Receiver<Bytes>,
    done: mpsc::Sender<Result<()>>,
) {
    while let Some(packet) = jobs.recv().await {
        let result = sink.send_packet(&packet).await;
        if done.send(result).await.is_err() {
            break;
        }
    }
}

/// Receive pump: keeps one read outstanding on the packet source.
///
/// Per-packet decoding failures are dropped here so the engine only
/// sees complete packets and terminal conditions.
async fn rx_loop<R: PacketSource>(mut source: R, events: mpsc::Sender<Result<Bytes>>) {
    let mut scratch = [0u8; SCRATCH_SIZE];
    loop {
        match source.recv_packet(&mut scratch).await {
            Ok(len) => {
                let packet = Bytes::copy_from_slice(&scratch[..len]);
                if events.send(Ok(packet)).await.is_err() {
                    return;
                }
            }
            Err(err) if !err.is_terminal() => {
                tracing::debug!(error = %err, "dropping undecodable packet");
            }
            Err(err) => {
                let _ = events.send(Err(err)).await;
                return;
            }
        }
    }
}

struct Engine {
    mtu: usize,
    running: bool,
    outbound_seqno: u16,
    /// Seqno of the operation whose packet is on the wire.
    transmitting: Option<u16>,
    /// Single-slot queue behind the wire.
    pending_op: Option<EndpointOperation>,
    /// Operations awaiting their reply, registered from the moment
    /// their transmit begins.
    expected_acks: HashMap<u16, EndpointOperation>,
    jobs: Option<mpsc::Sender<Bytes>>,
    on_stopped: Option<oneshot::Sender<DrivelinkError>>,
}

async fn engine_loop(
    mut engine: Engine,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut tx_done_rx: mpsc::Receiver<Result<()>>,
    mut rx_evt_rx: mpsc::Receiver<Result<Bytes>>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Invoke(request)) => engine.on_invoke(request).await,
                Some(Command::Cancel(handle)) => engine.on_cancel(handle),
                // Every handle dropped: tear the stack down.
                None => {
                    engine.stop(DrivelinkError::Closed);
                    break;
                }
            },
            Some(result) = tx_done_rx.recv() => engine.on_tx_done(result).await,
            // Reply dispatch is pure bookkeeping; it runs whether or not
            // a transmit is in flight.
            Some(event) = rx_evt_rx.recv() => engine.on_rx_event(event),
        }
    }
}

impl Engine {
    async fn on_invoke(&mut self, request: InvokeRequest) {
        if !self.running {
            let _ = request.accepted.send(Err(DrivelinkError::Closed));
            return;
        }
        if request.tx_payload.len() + REQUEST_HEADER_SIZE > self.mtu {
            let _ = request
                .accepted
                .send(Err(DrivelinkError::BufferTooSmall("request exceeds MTU")));
            return;
        }
        if self.transmitting.is_some() && self.pending_op.is_some() {
            let _ = request.accepted.send(Err(DrivelinkError::Busy));
            return;
        }

        let seqno = self.outbound_seqno;
        self.outbound_seqno = self.outbound_seqno.wrapping_add(1);

        let (done_tx, done_rx) = oneshot::channel();
        let op = EndpointOperation {
            handle: request.handle,
            seqno,
            endpoint_id: request.endpoint_id,
            tx_payload: request.tx_payload,
            rx_buf: request.rx_buf,
            done: Some(done_tx),
        };

        if request.accepted.send(Ok(done_rx)).is_err() {
            // Caller went away between submit and accept; drop the op.
            return;
        }

        if self.transmitting.is_none() {
            self.begin_transmit(op).await;
        } else {
            self.pending_op = Some(op);
        }
    }

    async fn begin_transmit(&mut self, op: EndpointOperation) {
        let header = RequestHeader {
            seqno: op.seqno,
            endpoint_id: op.endpoint_id,
        }
        .encode();

        let mut packet = BytesMut::with_capacity(REQUEST_HEADER_SIZE + op.tx_payload.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&op.tx_payload);

        tracing::trace!(
            seqno = op.seqno,
            endpoint_id = op.endpoint_id,
            len = op.tx_payload.len(),
            "transmitting request"
        );

        // Register before the packet is handed to the writer: a reply
        // that arrives while the write is still in flight must find its
        // entry.
        let seqno = op.seqno;
        if let Some(mut evicted) = self.expected_acks.insert(seqno, op) {
            tracing::warn!(seqno, "sequence number reused; evicting stale operation");
            evicted.complete(Err(DrivelinkError::Protocol(format!(
                "sequence number {seqno} reused while awaiting reply"
            ))));
        }
        self.transmitting = Some(seqno);

        let writer_gone = match &self.jobs {
            Some(jobs) => jobs.send(packet.freeze()).await.is_err(),
            None => true,
        };
        if writer_gone {
            self.stop(DrivelinkError::Closed);
        }
    }

    async fn on_tx_done(&mut self, result: Result<()>) {
        let Some(seqno) = self.transmitting.take() else {
            return;
        };

        if let Err(err) = result {
            tracing::debug!(error = %err, "transmit failed");
            if err.is_terminal() {
                self.stop(err);
                return;
            }
            // The write failed before the packet reached the wire; no
            // reply can follow. The entry is already gone if a racing
            // reply or a cancel settled the operation first.
            if let Some(mut op) = self.expected_acks.remove(&seqno) {
                op.complete(Err(err));
            }
        }

        if let Some(next) = self.pending_op.take() {
            self.begin_transmit(next).await;
        }
    }

    fn on_rx_event(&mut self, event: Result<Bytes>) {
        match event {
            Ok(packet) if self.running => self.dispatch_reply(packet),
            Ok(_) => {}
            Err(err) => self.stop(err),
        }
    }

    fn dispatch_reply(&mut self, packet: Bytes) {
        let Some((seqno, payload)) = decode_reply(&packet) else {
            tracing::debug!(len = packet.len(), "dropping short reply packet");
            return;
        };

        match self.expected_acks.remove(&seqno) {
            Some(mut op) => {
                let room = op.rx_buf.capacity() - op.rx_buf.len();
                let take = payload.len().min(room);
                op.rx_buf.extend_from_slice(&payload[..take]);
                let buf = std::mem::take(&mut op.rx_buf);
                op.complete(Ok(buf));
            }
            None => tracing::trace!(seqno, "dropping reply with no matching request"),
        }
    }

    fn on_cancel(&mut self, handle: OpHandle) {
        if self.pending_op.as_ref().is_some_and(|op| op.handle == handle) {
            let mut op = self.pending_op.take().expect("pending op checked above");
            op.complete(Err(DrivelinkError::Cancelled));
            return;
        }
        // Covers awaiting-ack and currently-transmitting operations
        // alike; a packet already committed to the wire still goes out,
        // only the reply expectation is withdrawn.
        let seqno = self
            .expected_acks
            .iter()
            .find(|(_, op)| op.handle == handle)
            .map(|(seqno, _)| *seqno);
        if let Some(seqno) = seqno {
            if let Some(mut op) = self.expected_acks.remove(&seqno) {
                op.complete(Err(DrivelinkError::Cancelled));
            }
        }
        // Unknown handles are operations that already completed; cancel
        // is idempotent.
    }

    fn stop(&mut self, reason: DrivelinkError) {
        if !self.running {
            return;
        }
        self.running = false;
        // Dropping the job sender shuts the writer task down.
        self.jobs = None;

        tracing::debug!(reason = %reason, "endpoint engine stopping");

        self.transmitting = None;
        if let Some(mut op) = self.pending_op.take() {
            op.complete(Err(DrivelinkError::Closed));
        }
        for (_, mut op) in self.expected_acks.drain() {
            op.complete(Err(DrivelinkError::Closed));
        }
        if let Some(on_stopped) = self.on_stopped.take() {
            let _ = on_stopped.send(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> (
        Engine,
        mpsc::Receiver<Bytes>,
        oneshot::Receiver<DrivelinkError>,
    ) {
        let (jobs_tx, jobs_rx) = mpsc::channel(4);
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let engine = Engine {
            mtu: DEFAULT_MTU,
            running: true,
            outbound_seqno: 0,
            transmitting: None,
            pending_op: None,
            expected_acks: HashMap::new(),
            jobs: Some(jobs_tx),
            on_stopped: Some(stopped_tx),
        };
        (engine, jobs_rx, stopped_rx)
    }

    async fn submit(
        engine: &mut Engine,
        endpoint_id: u16,
        payload: &[u8],
        handle: u64,
        rx_capacity: usize,
    ) -> Result<oneshot::Receiver<OpResult>> {
        let (accepted_tx, accepted_rx) = oneshot::channel();
        engine
            .on_invoke(InvokeRequest {
                endpoint_id,
                tx_payload: Bytes::copy_from_slice(payload),
                rx_buf: BytesMut::with_capacity(rx_capacity),
                handle: OpHandle(handle),
                accepted: accepted_tx,
            })
            .await;
        accepted_rx.await.expect("engine dropped accept channel")
    }

    #[tokio::test]
    async fn request_packet_layout() {
        let (mut engine, mut jobs, _stopped) = test_engine();
        submit(&mut engine, 0x0001, &[0xDE, 0xAD], 1, 32)
            .await
            .unwrap();

        let packet = jobs.recv().await.unwrap();
        assert_eq!(&packet[..], &[0x00, 0x00, 0x01, 0x80, 0xDE, 0xAD]);
    }

    #[tokio::test]
    async fn busy_when_both_slots_occupied() {
        let (mut engine, mut jobs, _stopped) = test_engine();
        submit(&mut engine, 1, &[], 1, 8).await.unwrap();
        submit(&mut engine, 1, &[], 2, 8).await.unwrap();

        let err = submit(&mut engine, 1, &[], 3, 8).await.unwrap_err();
        assert!(matches!(err, DrivelinkError::Busy));

        // The first two packets still go out in order.
        assert!(jobs.recv().await.is_some());
        engine.on_tx_done(Ok(())).await;
        assert!(jobs.recv().await.is_some());
    }

    #[tokio::test]
    async fn oversized_request_rejected() {
        let (mut engine, _jobs, _stopped) = test_engine();
        let payload = vec![0u8; DEFAULT_MTU - REQUEST_HEADER_SIZE + 1];
        let err = submit(&mut engine, 1, &payload, 1, 8).await.unwrap_err();
        assert!(matches!(err, DrivelinkError::BufferTooSmall(_)));
    }

    #[tokio::test]
    async fn reply_completes_matching_operation() {
        let (mut engine, mut jobs, _stopped) = test_engine();
        let done = submit(&mut engine, 0x0001, &[0xDE, 0xAD], 1, 32)
            .await
            .unwrap();
        jobs.recv().await.unwrap();
        engine.on_tx_done(Ok(())).await;

        engine.on_rx_event(Ok(Bytes::from_static(&[0x00, 0x00, 0xCA, 0xFE])));

        let buf = done.await.unwrap().unwrap();
        assert_eq!(&buf[..], &[0xCA, 0xFE]);
    }

    #[tokio::test]
    async fn reply_arriving_before_tx_completion_is_dispatched() {
        let (mut engine, mut jobs, _stopped) = test_engine();
        let done = submit(&mut engine, 1, &[0x01], 1, 8).await.unwrap();
        jobs.recv().await.unwrap();

        // The reply lands before the transmit completion is observed.
        engine.on_rx_event(Ok(Bytes::from_static(&[0x00, 0x00, 0x5A])));
        let buf = done.await.unwrap().unwrap();
        assert_eq!(&buf[..], &[0x5A]);

        // The late completion finds nothing left to do.
        engine.on_tx_done(Ok(())).await;
        assert!(engine.expected_acks.is_empty());
        assert!(engine.transmitting.is_none());
    }

    #[tokio::test]
    async fn unrelated_reply_dispatches_while_another_op_transmits() {
        let (mut engine, mut jobs, _stopped) = test_engine();
        let done_a = submit(&mut engine, 1, &[0xA0], 1, 8).await.unwrap();
        jobs.recv().await.unwrap();
        engine.on_tx_done(Ok(())).await;

        let _done_b = submit(&mut engine, 1, &[0xB0], 2, 8).await.unwrap();
        jobs.recv().await.unwrap();
        assert!(engine.transmitting.is_some());

        // A's reply must not wait for B's transmit completion.
        engine.on_rx_event(Ok(Bytes::from_static(&[0x00, 0x00, 0xCA])));
        let buf = done_a.await.unwrap().unwrap();
        assert_eq!(&buf[..], &[0xCA]);
    }

    #[tokio::test]
    async fn replies_match_out_of_order() {
        let (mut engine, mut jobs, _stopped) = test_engine();
        let done0 = submit(&mut engine, 1, &[0x01], 1, 8).await.unwrap();
        let done1 = submit(&mut engine, 1, &[0x02], 2, 8).await.unwrap();

        jobs.recv().await.unwrap();
        engine.on_tx_done(Ok(())).await;
        jobs.recv().await.unwrap();
        engine.on_tx_done(Ok(())).await;
        assert_eq!(engine.expected_acks.len(), 2);

        // Reply for seqno 1 first, then seqno 0.
        engine.on_rx_event(Ok(Bytes::from_static(&[0x01, 0x00, 0xBB])));
        engine.on_rx_event(Ok(Bytes::from_static(&[0x00, 0x00, 0xAA])));

        assert_eq!(&done0.await.unwrap().unwrap()[..], &[0xAA]);
        assert_eq!(&done1.await.unwrap().unwrap()[..], &[0xBB]);
    }

    #[tokio::test]
    async fn reply_clamped_to_buffer_capacity() {
        let (mut engine, mut jobs, _stopped) = test_engine();

        let (accepted_tx, accepted_rx) = oneshot::channel();
        let rx_buf = BytesMut::with_capacity(2);
        let capacity = rx_buf.capacity();
        engine
            .on_invoke(InvokeRequest {
                endpoint_id: 1,
                tx_payload: Bytes::new(),
                rx_buf,
                handle: OpHandle(1),
                accepted: accepted_tx,
            })
            .await;
        let done = accepted_rx.await.unwrap().unwrap();

        jobs.recv().await.unwrap();
        engine.on_tx_done(Ok(())).await;

        engine.on_rx_event(Ok(Bytes::from_static(&[
            0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06,
        ])));

        let buf = done.await.unwrap().unwrap();
        assert_eq!(buf.len(), capacity.min(6));
        assert_eq!(&buf[..2], &[0x01, 0x02]);
    }

    #[tokio::test]
    async fn unmatched_and_short_replies_are_dropped() {
        let (mut engine, mut jobs, _stopped) = test_engine();
        let done = submit(&mut engine, 1, &[], 1, 8).await.unwrap();
        jobs.recv().await.unwrap();
        engine.on_tx_done(Ok(())).await;

        engine.on_rx_event(Ok(Bytes::from_static(&[0x09, 0x00, 0xFF]))); // wrong seqno
        engine.on_rx_event(Ok(Bytes::from_static(&[0x00]))); // too short
        assert_eq!(engine.expected_acks.len(), 1);

        engine.on_rx_event(Ok(Bytes::from_static(&[0x00, 0x00])));
        let buf = done.await.unwrap().unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn seqno_reuse_evicts_older_operation() {
        let (mut engine, mut jobs, _stopped) = test_engine();
        let stale = submit(&mut engine, 1, &[], 1, 8).await.unwrap();
        jobs.recv().await.unwrap();
        engine.on_tx_done(Ok(())).await;

        // Force the counter to wrap back onto the outstanding seqno.
        engine.outbound_seqno = 0;
        let fresh = submit(&mut engine, 1, &[], 2, 8).await.unwrap();
        jobs.recv().await.unwrap();
        engine.on_tx_done(Ok(())).await;

        let err = stale.await.unwrap().unwrap_err();
        assert!(matches!(err, DrivelinkError::Protocol(_)));

        // The fresh operation owns the seqno now.
        engine.on_rx_event(Ok(Bytes::from_static(&[0x00, 0x00, 0x42])));
        assert_eq!(&fresh.await.unwrap().unwrap()[..], &[0x42]);
    }

    #[tokio::test]
    async fn cancel_pending_operation() {
        let (mut engine, mut jobs, _stopped) = test_engine();
        submit(&mut engine, 1, &[], 1, 8).await.unwrap();
        let done = submit(&mut engine, 1, &[], 2, 8).await.unwrap();

        engine.on_cancel(OpHandle(2));
        let err = done.await.unwrap().unwrap_err();
        assert!(matches!(err, DrivelinkError::Cancelled));

        // Completing the first TX must not resurrect the cancelled op.
        jobs.recv().await.unwrap();
        engine.on_tx_done(Ok(())).await;
        assert!(engine.pending_op.is_none());
        assert_eq!(engine.expected_acks.len(), 1);
    }

    #[tokio::test]
    async fn cancel_transmitting_operation_withdraws_reply_expectation() {
        let (mut engine, mut jobs, _stopped) = test_engine();
        let done = submit(&mut engine, 1, &[], 1, 8).await.unwrap();

        engine.on_cancel(OpHandle(1));
        let err = done.await.unwrap().unwrap_err();
        assert!(matches!(err, DrivelinkError::Cancelled));

        // The packet still completes on the wire but no ack is expected.
        jobs.recv().await.unwrap();
        engine.on_tx_done(Ok(())).await;
        assert!(engine.expected_acks.is_empty());
    }

    #[tokio::test]
    async fn cancel_awaiting_ack_operation() {
        let (mut engine, mut jobs, _stopped) = test_engine();
        let done = submit(&mut engine, 1, &[], 1, 8).await.unwrap();
        jobs.recv().await.unwrap();
        engine.on_tx_done(Ok(())).await;
        assert_eq!(engine.expected_acks.len(), 1);

        engine.on_cancel(OpHandle(1));
        let err = done.await.unwrap().unwrap_err();
        assert!(matches!(err, DrivelinkError::Cancelled));
        assert!(engine.expected_acks.is_empty());

        // Second cancel on the same handle is a no-op.
        engine.on_cancel(OpHandle(1));
    }

    #[tokio::test]
    async fn terminal_rx_stops_engine_and_drains_operations() {
        let (mut engine, mut jobs, stopped) = test_engine();
        let done0 = submit(&mut engine, 1, &[], 1, 8).await.unwrap();
        let done1 = submit(&mut engine, 1, &[], 2, 8).await.unwrap();
        jobs.recv().await.unwrap();
        engine.on_tx_done(Ok(())).await;

        engine.on_rx_event(Err(DrivelinkError::Closed));

        assert!(matches!(
            done0.await.unwrap().unwrap_err(),
            DrivelinkError::Closed
        ));
        assert!(matches!(
            done1.await.unwrap().unwrap_err(),
            DrivelinkError::Closed
        ));
        assert!(matches!(stopped.await.unwrap(), DrivelinkError::Closed));

        // Subsequent invokes are rejected immediately.
        let err = submit(&mut engine, 1, &[], 3, 8).await.unwrap_err();
        assert!(matches!(err, DrivelinkError::Closed));
    }

    #[tokio::test]
    async fn terminal_tx_failure_stops_engine() {
        let (mut engine, mut jobs, stopped) = test_engine();
        let done = submit(&mut engine, 1, &[], 1, 8).await.unwrap();
        jobs.recv().await.unwrap();

        engine.on_tx_done(Err(DrivelinkError::Closed)).await;

        assert!(matches!(
            done.await.unwrap().unwrap_err(),
            DrivelinkError::Closed
        ));
        assert!(matches!(stopped.await.unwrap(), DrivelinkError::Closed));
    }
}
