//! The SDO server-side protocol state machine. Classifying the initiate
//! frame either answers immediately or builds a multi-frame transaction
//! that holds an `OdProxy` across state transitions, storing the proxy
//! inside the transaction record itself.

use super::protocol::{self, BLOCK_SUB_INITIATE};
use crate::error::CanOpenError;
use crate::od::ObjectDictionary;
use crate::types::Msg;
use alloc::vec::Vec;
use log::{debug, warn};

/// What a server transaction does with an inbound frame or its initial
/// classification.
pub enum Outcome {
    /// A response was produced and the transaction is finished.
    Done(Msg),
    /// A response was produced; more frames are expected.
    Continue(Msg),
    /// A sub-block segment was consumed with no frame to send yet.
    Silent,
    /// The request must be aborted; no transaction survives.
    Abort(Msg),
}

enum State {
    SegRead { toggle: bool },
    SegWrite { toggle: bool },
    BlockWrite { expected_seq: u8, total_len: usize, received: usize, holdback: Vec<u8>, awaiting_end: bool },
}

pub struct ServerTransaction {
    tx_cobid: u32,
    index: u16,
    sub_index: u8,
    proxy: crate::od::OdProxy,
    state: State,
}

impl ServerTransaction {
    /// Classifies an initiate frame. Returns the immediate outcome
    /// (what to send now) and, when the exchange continues, the
    /// transaction to keep driving across subsequent frames.
    pub fn start(msg: &Msg, tx_cobid: u32, od: &mut ObjectDictionary) -> (Outcome, Option<Self>) {
        if protocol::require_len8(msg).is_err() {
            let resp = protocol::abort_frame(tx_cobid, 0, 0, CanOpenError::ParamLengthMismatch.abort_code());
            return (Outcome::Abort(resp), None);
        }
        let index = u16::from_le_bytes([msg.data[1], msg.data[2]]);
        let sub_index = msg.data[3];
        let cs = protocol::cs_code(msg.data[0]);
        let abort = |e: CanOpenError| {
            (Outcome::Abort(protocol::abort_frame(tx_cobid, index, sub_index, e.abort_code())), None)
        };

        match cs {
            c if c == protocol::CS_UPLOAD_INITIATE_REQ => {
                let mut proxy = match od.make_proxy(index, sub_index) {
                    Ok(p) => p,
                    Err(e) => return abort(e),
                };
                let len = proxy.remaining();
                if len <= 4 {
                    let mut buf = alloc::vec![0u8; len];
                    if let Err(e) = proxy.copy_into(&mut buf) {
                        return abort(e);
                    }
                    debug!("SDO server expedited upload {:#06x}[{}], {} bytes", index, sub_index, len);
                    (Outcome::Done(protocol::upload_initiate_expedited(tx_cobid, index, sub_index, &buf)), None)
                } else {
                    debug!("SDO server segmented upload {:#06x}[{}], {} bytes", index, sub_index, len);
                    let resp = protocol::upload_initiate_segmented(tx_cobid, index, sub_index, len as u32);
                    let tx = ServerTransaction { tx_cobid, index, sub_index, proxy, state: State::SegRead { toggle: false } };
                    (Outcome::Continue(resp), Some(tx))
                }
            }
            c if c == protocol::CS_DOWNLOAD_INITIATE_REQ => {
                let es = msg.data[0] & 0b11;
                let mut proxy = match od.make_proxy(index, sub_index) {
                    Ok(p) => p,
                    Err(e) => return abort(e),
                };
                if es == 0b11 {
                    let n_empty = (msg.data[0] >> 2) & 0b11;
                    let len = (4 - n_empty) as usize;
                    if let Err(e) = proxy.copy_from(&msg.data[4..4 + len]) {
                        return abort(e);
                    }
                    debug!("SDO server expedited download {:#06x}[{}], {} bytes", index, sub_index, len);
                    (Outcome::Done(protocol::download_initiate_response(tx_cobid, index, sub_index)), None)
                } else {
                    debug!("SDO server segmented download {:#06x}[{}]", index, sub_index);
                    let resp = protocol::download_initiate_response(tx_cobid, index, sub_index);
                    let tx = ServerTransaction { tx_cobid, index, sub_index, proxy, state: State::SegWrite { toggle: false } };
                    (Outcome::Continue(resp), Some(tx))
                }
            }
            c if c == protocol::CS_BLOCK_REQ => {
                let sub = (msg.data[0] >> 1) & 0b11;
                if sub != BLOCK_SUB_INITIATE {
                    return abort(CanOpenError::InvalidCommandSpecifier);
                }
                let total_len = u32::from_le_bytes([msg.data[4], msg.data[5], msg.data[6], msg.data[7]]) as usize;
                let proxy = match od.make_proxy(index, sub_index) {
                    Ok(p) => p,
                    Err(e) => return abort(e),
                };
                debug!("SDO server block download {:#06x}[{}], {} bytes", index, sub_index, total_len);
                let resp =
                    protocol::block_download_initiate_response(tx_cobid, index, sub_index, crate::od::constants::BLOCK_SIZE);
                let tx = ServerTransaction {
                    tx_cobid,
                    index,
                    sub_index,
                    proxy,
                    state: State::BlockWrite {
                        expected_seq: 1,
                        total_len,
                        received: 0,
                        holdback: Vec::new(),
                        awaiting_end: false,
                    },
                };
                (Outcome::Continue(resp), Some(tx))
            }
            _ => abort(CanOpenError::InvalidCommandSpecifier),
        }
    }

    pub fn process(&mut self, msg: &Msg, _od: &mut ObjectDictionary) -> Outcome {
        if let Err(e) = protocol::require_len8(msg) {
            return self.abort(e);
        }
        let cs = protocol::cs_code(msg.data[0]);
        match &mut self.state {
            State::SegRead { toggle } => {
                if cs != protocol::CS_UPLOAD_SEGMENT_REQ {
                    return Self::abort_with(self.tx_cobid, self.index, self.sub_index, CanOpenError::InvalidCommandSpecifier);
                }
                let req_toggle = (msg.data[0] >> 4) & 1 == 1;
                if req_toggle != *toggle {
                    return Self::abort_with(self.tx_cobid, self.index, self.sub_index, CanOpenError::ToggleNotAlternated);
                }
                let remaining = self.proxy.remaining();
                let chunk_len = remaining.min(7);
                let mut chunk = alloc::vec![0u8; chunk_len];
                if let Err(e) = self.proxy.copy_into(&mut chunk) {
                    return Self::abort_with(self.tx_cobid, self.index, self.sub_index, e);
                }
                let last = self.proxy.remaining() == 0;
                let resp = protocol::upload_segment_resp(self.tx_cobid, *toggle, &chunk, last);
                if last {
                    Outcome::Done(resp)
                } else {
                    *toggle = !*toggle;
                    Outcome::Continue(resp)
                }
            }
            State::SegWrite { toggle } => {
                if cs != protocol::CS_DOWNLOAD_SEGMENT_REQ {
                    return Self::abort_with(self.tx_cobid, self.index, self.sub_index, CanOpenError::InvalidCommandSpecifier);
                }
                let req_toggle = (msg.data[0] >> 4) & 1 == 1;
                if req_toggle != *toggle {
                    return Self::abort_with(self.tx_cobid, self.index, self.sub_index, CanOpenError::ToggleNotAlternated);
                }
                let n_empty = (msg.data[0] >> 1) & 0b111;
                let last = msg.data[0] & 1 == 1;
                let chunk_len = (7 - n_empty) as usize;
                if let Err(e) = self.proxy.copy_from(&msg.data[1..1 + chunk_len]) {
                    return Self::abort_with(self.tx_cobid, self.index, self.sub_index, e);
                }
                let resp = protocol::download_segment_resp(self.tx_cobid, *toggle);
                if last {
                    Outcome::Done(resp)
                } else {
                    *toggle = !*toggle;
                    Outcome::Continue(resp)
                }
            }
            State::BlockWrite { expected_seq, total_len, received, holdback, awaiting_end } => {
                if *awaiting_end {
                    if cs != protocol::CS_BLOCK_REQ {
                        return Self::abort_with(self.tx_cobid, self.index, self.sub_index, CanOpenError::InvalidCommandSpecifier);
                    }
                    let n_empty = (msg.data[0] >> 2) & 0b111;
                    let last_bytes = (7 - n_empty) as usize;
                    if last_bytes > holdback.len() {
                        return Self::abort_with(self.tx_cobid, self.index, self.sub_index, CanOpenError::ParamLengthMismatch);
                    }
                    if let Err(e) = self.proxy.copy_from(&holdback[..last_bytes]) {
                        return Self::abort_with(self.tx_cobid, self.index, self.sub_index, e);
                    }
                    *received += last_bytes;
                    if *received != *total_len {
                        return Self::abort_with(self.tx_cobid, self.index, self.sub_index, CanOpenError::ParamLengthMismatch);
                    }
                    return Outcome::Done(protocol::block_end_resp(self.tx_cobid));
                }
                let seqno = msg.data[0] & 0x7F;
                let last_segment = msg.data[0] & 0x80 != 0;
                if seqno != *expected_seq {
                    return Self::abort_with(self.tx_cobid, self.index, self.sub_index, CanOpenError::InvalidSequenceNumber);
                }
                if !holdback.is_empty() {
                    if let Err(e) = self.proxy.copy_from(holdback) {
                        return Self::abort_with(self.tx_cobid, self.index, self.sub_index, e);
                    }
                    *received += holdback.len();
                }
                holdback.clear();
                holdback.extend_from_slice(&msg.data[1..8]);
                *expected_seq = expected_seq.wrapping_add(1);
                if last_segment {
                    *awaiting_end = true;
                    Outcome::Continue(protocol::block_ack(self.tx_cobid, seqno, crate::od::constants::BLOCK_SIZE))
                } else if *expected_seq > crate::od::constants::BLOCK_SIZE {
                    let ack_seq = *expected_seq - 1;
                    *expected_seq = 1;
                    Outcome::Continue(protocol::block_ack(self.tx_cobid, ack_seq, crate::od::constants::BLOCK_SIZE))
                } else {
                    Outcome::Silent
                }
            }
        }
    }

    pub fn tx_cobid(&self) -> u32 {
        self.tx_cobid
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn sub_index(&self) -> u8 {
        self.sub_index
    }

    fn abort(&self, err: CanOpenError) -> Outcome {
        Self::abort_with(self.tx_cobid, self.index, self.sub_index, err)
    }

    fn abort_with(tx_cobid: u32, index: u16, sub_index: u8, err: CanOpenError) -> Outcome {
        warn!("SDO server aborting {:#06x}[{}]: {}", index, sub_index, err);
        Outcome::Abort(protocol::abort_frame(tx_cobid, index, sub_index, err.abort_code()))
    }
}
