//! Transaction multiplexing for the SDO client and server state machines.
//! `SdoService` keeps a `servers` table mapping an incoming request
//! COB-ID to the response COB-ID and remote node it belongs to, and an
//! `active` table keyed by whichever COB-ID the next frame for that
//! exchange will arrive on.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ClientTransaction, Outcome as ClientOutcome};
pub use server::{Outcome as ServerOutcome, ServerTransaction};

use crate::clock::{Clock, Generation, GenerationCounter, TimerHandle};
use crate::error::{CanOpenError, Result};
use crate::od::ObjectDictionary;
use crate::types::Msg;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use log::{debug, warn};

/// Invoked once, with the final status, when a client transaction
/// finishes (completed, timed out, or aborted by the remote).
pub type CompletionCallback = Box<dyn FnMut(Result<()>) + Send>;

enum Transaction {
    Client { inner: ClientTransaction, timer: TimerHandle, generation: Generation, callback: Option<CompletionCallback> },
    /// Carries the same inactivity timer + generation every transaction
    /// gets; the only difference from `Client` is that there is no
    /// completion callback to invoke on timeout, since nothing local
    /// started this exchange.
    Server { inner: ServerTransaction, timer: TimerHandle, generation: Generation },
}

/// Builds the closure a timer fires when a transaction on `key` times
/// out. `LocalNode` is the only thing that can build this safely: it
/// closes over a raw pointer back to itself (the same discipline
/// `OdProxy` uses for a locked entry) and calls `transaction_timeout`
/// when invoked, tagged with the generation captured at arming time so
/// a stale callback is a no-op.
pub type TimeoutCbFactory<'a> = &'a mut dyn FnMut(u32, Generation) -> Box<dyn FnMut() + Send>;

/// Owns every in-flight SDO exchange for a node. Holds no reference to
/// the bus or clock; callers pass them in per call, matching the
/// borrowed-context shape the other services use.
pub struct SdoService {
    servers: BTreeMap<u32, (u32, u8)>,
    active: BTreeMap<u32, Transaction>,
    generation: GenerationCounter,
    segment_timeout_ms: u64,
}

impl SdoService {
    pub fn new(segment_timeout_ms: u64) -> Self {
        SdoService { servers: BTreeMap::new(), active: BTreeMap::new(), generation: GenerationCounter::default(), segment_timeout_ms }
    }

    /// Registers this node as an SDO server answering requests on
    /// `rx_cobid`, replying on `tx_cobid` to `remote_node`.
    pub fn add_sdo_server(&mut self, rx_cobid: u32, tx_cobid: u32, remote_node: u8) {
        self.servers.insert(rx_cobid, (tx_cobid, remote_node));
    }

    /// Starts a client transaction against `remote_node`, using the SDO
    /// client parameter record in the OD (`0x1280+i`) whose sub 3
    /// matches that node: sub 1 is the tx (request) COB-ID, sub 2 the
    /// rx (response) COB-ID.
    #[allow(clippy::too_many_arguments)]
    pub fn client_transaction(
        &mut self,
        read: bool,
        remote_node: u8,
        index: u16,
        sub_index: u8,
        od: &mut ObjectDictionary,
        bus: &mut dyn crate::bus::Bus,
        clock: &mut dyn Clock,
        make_timeout_cb: TimeoutCbFactory,
        callback: Option<CompletionCallback>,
    ) -> Result<()> {
        let (tx_cobid, rx_cobid) = self.find_client_params(remote_node, od).ok_or(CanOpenError::IndexNotFound)?;
        if self.active.contains_key(&rx_cobid) {
            return Err(CanOpenError::Error);
        }
        let (tx, req) = if read {
            ClientTransaction::initiate_read(index, sub_index, tx_cobid, od)?
        } else {
            ClientTransaction::initiate_write(index, sub_index, tx_cobid, od)?
        };
        bus.write(&req, false)?;
        let generation = self.generation.next();
        let timer = self.arm_timeout(rx_cobid, generation, clock, make_timeout_cb);
        self.active.insert(rx_cobid, Transaction::Client { inner: tx, timer, generation, callback });
        Ok(())
    }

    fn find_client_params(&self, remote_node: u8, od: &mut ObjectDictionary) -> Option<(u32, u32)> {
        for i in 0..0x80u16 {
            let idx = crate::od::constants::IDX_SDO_CLIENT_PARAM_START + i;
            if !od.entry_exists(idx, 3) {
                continue;
            }
            if od.get_u8(idx, 3).ok()? == remote_node {
                let tx = od.get_u32(idx, 1).ok()?;
                let rx = od.get_u32(idx, 2).ok()?;
                return Some((tx, rx));
            }
        }
        None
    }

    fn arm_timeout(&mut self, key: u32, generation: Generation, clock: &mut dyn Clock, make_timeout_cb: TimeoutCbFactory) -> TimerHandle {
        clock.schedule_delayed(self.segment_timeout_ms, make_timeout_cb(key, generation))
    }

    /// Re-arms the inactivity timer for `key` after a frame was
    /// successfully processed, stamping it with a fresh generation so
    /// the previous timer's callback becomes inert if it is still
    /// pending.
    fn reset_timeout(&mut self, key: u32, clock: &mut dyn Clock, make_timeout_cb: TimeoutCbFactory) {
        let Some(Transaction::Client { timer, generation, .. }) = self.active.get_mut(&key) else { return };
        clock.delete_timer(timer);
        let new_generation = self.generation.next();
        if let Some(Transaction::Client { timer, generation, .. }) = self.active.get_mut(&key) {
            *generation = new_generation;
            *timer = clock.schedule_delayed(self.segment_timeout_ms, make_timeout_cb(key, new_generation));
        }
    }

    /// Dispatches an inbound SDO frame. `cobid` is the frame's CAN id;
    /// it doubles as the transaction key.
    pub fn process_msg(
        &mut self,
        cobid: u32,
        msg: &Msg,
        od: &mut ObjectDictionary,
        bus: &mut dyn crate::bus::Bus,
        clock: &mut dyn Clock,
        make_timeout_cb: TimeoutCbFactory,
    ) {
        if let Some(tx) = self.active.get_mut(&cobid) {
            match tx {
                Transaction::Client { inner, .. } => {
                    let outcome = inner.process(msg);
                    self.handle_client_outcome(cobid, outcome, bus, clock, make_timeout_cb);
                }
                Transaction::Server { inner, .. } => {
                    let outcome = inner.process(msg, od);
                    self.handle_server_outcome(cobid, outcome, bus, clock, make_timeout_cb);
                }
            }
            return;
        }
        if let Some(&(tx_cobid, _remote_node)) = self.servers.get(&cobid) {
            let (outcome, tx) = ServerTransaction::start(msg, tx_cobid, od);
            match outcome {
                ServerOutcome::Done(resp) => {
                    let _ = bus.write(&resp, false);
                }
                ServerOutcome::Continue(resp) => {
                    let _ = bus.write(&resp, false);
                    if let Some(tx) = tx {
                        let generation = self.generation.next();
                        let timer = self.arm_timeout(cobid, generation, clock, make_timeout_cb);
                        self.active.insert(cobid, Transaction::Server { inner: tx, timer, generation });
                    }
                }
                ServerOutcome::Abort(resp) => {
                    let _ = bus.write(&resp, false);
                }
                ServerOutcome::Silent => {}
            }
            return;
        }
        debug!("SDO frame on {:#05x} matches no server registration or active transaction", cobid);
    }

    fn handle_client_outcome(
        &mut self,
        key: u32,
        outcome: ClientOutcome,
        bus: &mut dyn crate::bus::Bus,
        clock: &mut dyn Clock,
        make_timeout_cb: TimeoutCbFactory,
    ) {
        match outcome {
            ClientOutcome::Continue(msg) => {
                let _ = bus.write(&msg, false);
                self.reset_timeout(key, clock, make_timeout_cb);
                // Block-mode sub-block segments are sent back-to-back
                // with nothing from the server in between; keep pumping
                // until the transaction is waiting on a real frame again.
                loop {
                    let self_driving = matches!(self.active.get(&key), Some(Transaction::Client { inner, .. }) if inner.is_self_driving());
                    if !self_driving {
                        break;
                    }
                    let Some(Transaction::Client { inner, .. }) = self.active.get_mut(&key) else { break };
                    let next = inner.process(&msg);
                    match next {
                        ClientOutcome::Continue(next_msg) => {
                            let _ = bus.write(&next_msg, false);
                        }
                        ClientOutcome::Done => {
                            self.finish_client(key, Ok(()), clock);
                            break;
                        }
                        ClientOutcome::Aborted(e) => {
                            self.finish_client(key, Err(e), clock);
                            break;
                        }
                    }
                }
            }
            ClientOutcome::Done => self.finish_client(key, Ok(()), clock),
            ClientOutcome::Aborted(e) => self.finish_client(key, Err(e), clock),
        }
    }

    fn handle_server_outcome(
        &mut self,
        key: u32,
        outcome: ServerOutcome,
        bus: &mut dyn crate::bus::Bus,
        clock: &mut dyn Clock,
        make_timeout_cb: TimeoutCbFactory,
    ) {
        match outcome {
            ServerOutcome::Continue(resp) => {
                let _ = bus.write(&resp, false);
                self.reset_server_timeout(key, clock, make_timeout_cb);
            }
            ServerOutcome::Silent => {
                // A sub-block segment with nothing to send yet still
                // counts as activity; the block isn't done until the
                // next `Continue`/`Done`/`Abort`.
                self.reset_server_timeout(key, clock, make_timeout_cb);
            }
            ServerOutcome::Done(resp) => {
                let _ = bus.write(&resp, false);
                self.remove(key, clock);
            }
            ServerOutcome::Abort(resp) => {
                let _ = bus.write(&resp, false);
                self.remove(key, clock);
            }
        }
    }

    /// Re-arms a server transaction's inactivity timer after a frame was
    /// successfully processed. Mirrors `reset_timeout`, minus a
    /// completion callback: a server transaction has none.
    fn reset_server_timeout(&mut self, key: u32, clock: &mut dyn Clock, make_timeout_cb: TimeoutCbFactory) {
        let Some(Transaction::Server { timer, .. }) = self.active.get_mut(&key) else { return };
        clock.delete_timer(timer);
        let new_generation = self.generation.next();
        if let Some(Transaction::Server { timer, generation, .. }) = self.active.get_mut(&key) {
            *generation = new_generation;
            *timer = clock.schedule_delayed(self.segment_timeout_ms, make_timeout_cb(key, new_generation));
        }
    }

    fn finish_client(&mut self, key: u32, status: Result<()>, clock: &mut dyn Clock) {
        if let Some(Transaction::Client { timer, mut callback, .. }) = self.active.remove(&key) {
            clock.delete_timer(&timer);
            if let Some(cb) = callback.as_mut() {
                cb(status);
            }
        }
    }

    fn remove(&mut self, key: u32, clock: &mut dyn Clock) {
        match self.active.remove(&key) {
            Some(Transaction::Client { timer, .. }) => clock.delete_timer(&timer),
            Some(Transaction::Server { timer, .. }) => clock.delete_timer(&timer),
            None => {}
        }
    }

    /// Fired by the clock when a transaction's inactivity timer expires.
    /// A stale generation (the transaction already progressed and was
    /// re-armed, or finished) is ignored. A server transaction has no
    /// completion callback to invoke, so it's just aborted and dropped,
    /// releasing the `OdProxy` lock it was holding.
    pub fn transaction_timeout(&mut self, key: u32, generation: Generation, bus: &mut dyn crate::bus::Bus, clock: &mut dyn Clock) {
        let (current, index, sub_index, is_server) = match self.active.get(&key) {
            Some(Transaction::Client { generation: g, inner, .. }) => (*g, inner.index(), inner.sub_index(), false),
            Some(Transaction::Server { generation: g, inner, .. }) => (*g, inner.index(), inner.sub_index(), true),
            None => return,
        };
        if current != generation {
            return;
        }
        warn!("SDO transaction on {:#05x} timed out", key);
        let abort = protocol::abort_frame(key, index, sub_index, CanOpenError::Timeout.abort_code());
        let _ = bus.write(&abort, false);
        if is_server {
            self.remove(key, clock);
        } else {
            self.finish_client(key, Err(CanOpenError::Timeout), clock);
        }
    }

    /// Drops every active transaction, notifying client callbacks with
    /// `InternalError`. Used for node teardown. Server transactions have
    /// no callback but still need their timer cancelled and their
    /// `OdProxy` lock released.
    pub fn clear(&mut self, clock: &mut dyn Clock) {
        for (_, tx) in core::mem::take(&mut self.active) {
            match tx {
                Transaction::Client { timer, mut callback, .. } => {
                    clock.delete_timer(&timer);
                    if let Some(cb) = callback.as_mut() {
                        cb(Err(CanOpenError::InternalError));
                    }
                }
                Transaction::Server { timer, .. } => {
                    clock.delete_timer(&timer);
                }
            }
        }
    }
}
