//! The SDO client-side protocol state machine. Starting a read or write
//! chooses expedited, segmented, or block framing up front based on the
//! local value's size, then `process_msg` drives the remaining exchange
//! frame by frame.

use super::protocol;
use crate::error::CanOpenError;
use crate::od::{constants, ObjectDictionary, OdProxy};
use crate::types::Msg;
use log::debug;

enum State {
    AwaitUploadInitiate,
    SegRead { toggle: bool },
    AwaitDownloadInitiateAck,
    SegWrite { toggle: bool },
    AwaitBlockInitiateAck { remaining: usize },
    BlockWrite { seqno: u8, remaining: usize },
    AwaitBlockAck { remaining: usize, last_chunk_len: usize },
    AwaitBlockEndAck,
}

/// What the client does after processing a frame.
pub enum Outcome {
    /// The transfer is complete.
    Done,
    /// Send this frame and keep waiting.
    Continue(Msg),
    /// The remote aborted, or a local protocol violation occurred.
    Aborted(CanOpenError),
}

pub struct ClientTransaction {
    tx_cobid: u32,
    index: u16,
    sub_index: u8,
    proxy: OdProxy,
    state: State,
}

impl ClientTransaction {
    /// Initiates a read (SDO upload): the local proxy is the landing
    /// site the received value is written into.
    pub fn initiate_read(index: u16, sub_index: u8, tx_cobid: u32, od: &mut ObjectDictionary) -> Result<(Self, Msg), CanOpenError> {
        let proxy = od.make_proxy(index, sub_index)?;
        let req = Msg::new(tx_cobid, &{
            let mut d = [0u8; 8];
            d[0] = protocol::CS_UPLOAD_INITIATE_REQ << 5;
            d[1..3].copy_from_slice(&index.to_le_bytes());
            d[3] = sub_index;
            d
        });
        let tx = ClientTransaction { tx_cobid, index, sub_index, proxy, state: State::AwaitUploadInitiate };
        Ok((tx, req))
    }

    /// Initiates a write (SDO download): the local proxy is the source
    /// the outgoing bytes are read from.
    pub fn initiate_write(index: u16, sub_index: u8, tx_cobid: u32, od: &mut ObjectDictionary) -> Result<(Self, Msg), CanOpenError> {
        let mut proxy = od.make_proxy(index, sub_index)?;
        let len = proxy.remaining();
        if len <= 4 {
            let mut buf = [0u8; 4];
            proxy.copy_into(&mut buf[..len])?;
            let req = protocol::download_initiate(tx_cobid, index, sub_index, &buf[..len], None);
            let tx = ClientTransaction { tx_cobid, index, sub_index, proxy, state: State::AwaitDownloadInitiateAck };
            Ok((tx, req))
        } else if len < constants::BLOCK_MODE_THRESHOLD {
            let req = protocol::download_initiate(tx_cobid, index, sub_index, &[], Some(len as u32));
            let tx = ClientTransaction { tx_cobid, index, sub_index, proxy, state: State::AwaitDownloadInitiateAck };
            Ok((tx, req))
        } else {
            debug!("SDO client using block mode for {:#06x}[{}], {} bytes", index, sub_index, len);
            let req = protocol::block_download_initiate(tx_cobid, index, sub_index, len as u32);
            let tx = ClientTransaction { tx_cobid, index, sub_index, proxy, state: State::AwaitBlockInitiateAck { remaining: len } };
            Ok((tx, req))
        }
    }

    pub fn process(&mut self, msg: &Msg) -> Outcome {
        if protocol::require_len8(msg).is_err() {
            return Outcome::Aborted(CanOpenError::ParamLengthMismatch);
        }
        if let Some((_, _, code)) = protocol::parse_abort(msg) {
            return Outcome::Aborted(CanOpenError::from_abort_code(code));
        }
        let cs = protocol::cs_code(msg.data[0]);

        match &mut self.state {
            State::AwaitUploadInitiate => {
                if cs != protocol::CS_UPLOAD_INITIATE_RESP {
                    return Outcome::Aborted(CanOpenError::InvalidCommandSpecifier);
                }
                let es = msg.data[0] & 0b11;
                if es == 0b11 {
                    let n_empty = (msg.data[0] >> 2) & 0b11;
                    let len = (4 - n_empty) as usize;
                    if let Err(e) = self.fit_local_buffer(len) {
                        return Outcome::Aborted(e);
                    }
                    if let Err(e) = self.proxy.copy_from(&msg.data[4..4 + len]) {
                        return Outcome::Aborted(e);
                    }
                    Outcome::Done
                } else {
                    let total_len = u32::from_le_bytes([msg.data[4], msg.data[5], msg.data[6], msg.data[7]]) as usize;
                    if let Err(e) = self.fit_local_buffer(total_len) {
                        return Outcome::Aborted(e);
                    }
                    self.state = State::SegRead { toggle: false };
                    Outcome::Continue(protocol::upload_segment_req(self.tx_cobid, false))
                }
            }
            State::SegRead { toggle } => {
                if cs != protocol::CS_UPLOAD_SEGMENT_RESP {
                    return Outcome::Aborted(CanOpenError::InvalidCommandSpecifier);
                }
                let resp_toggle = (msg.data[0] >> 4) & 1 == 1;
                if resp_toggle != *toggle {
                    return Outcome::Aborted(CanOpenError::ToggleNotAlternated);
                }
                let n_empty = (msg.data[0] >> 1) & 0b111;
                let last = msg.data[0] & 1 == 1;
                let chunk_len = (7 - n_empty) as usize;
                if let Err(e) = self.proxy.copy_from(&msg.data[1..1 + chunk_len]) {
                    return Outcome::Aborted(e);
                }
                if last {
                    Outcome::Done
                } else {
                    *toggle = !*toggle;
                    Outcome::Continue(protocol::upload_segment_req(self.tx_cobid, *toggle))
                }
            }
            State::AwaitDownloadInitiateAck => {
                if cs != protocol::CS_DOWNLOAD_INITIATE_RESP {
                    return Outcome::Aborted(CanOpenError::InvalidCommandSpecifier);
                }
                if self.proxy.remaining() == 0 {
                    return Outcome::Done;
                }
                self.state = State::SegWrite { toggle: false };
                self.send_next_segment(false)
            }
            State::SegWrite { toggle } => {
                if cs != protocol::CS_DOWNLOAD_SEGMENT_RESP {
                    return Outcome::Aborted(CanOpenError::InvalidCommandSpecifier);
                }
                let resp_toggle = (msg.data[0] >> 4) & 1 == 1;
                if resp_toggle != *toggle {
                    return Outcome::Aborted(CanOpenError::ToggleNotAlternated);
                }
                if self.proxy.remaining() == 0 {
                    return Outcome::Done;
                }
                let next_toggle = !*toggle;
                self.send_next_segment(next_toggle)
            }
            State::AwaitBlockInitiateAck { remaining } => {
                if cs != protocol::CS_BLOCK_RESP {
                    return Outcome::Aborted(CanOpenError::InvalidCommandSpecifier);
                }
                self.state = State::BlockWrite { seqno: 1, remaining: *remaining };
                self.send_next_block_segment()
            }
            State::AwaitBlockAck { remaining, last_chunk_len } => {
                if cs != protocol::CS_BLOCK_RESP {
                    return Outcome::Aborted(CanOpenError::InvalidCommandSpecifier);
                }
                if *remaining == 0 {
                    let last_bytes = *last_chunk_len as u8;
                    self.state = State::AwaitBlockEndAck;
                    Outcome::Continue(protocol::block_end_req(self.tx_cobid, last_bytes))
                } else {
                    self.state = State::BlockWrite { seqno: 1, remaining: *remaining };
                    self.send_next_block_segment()
                }
            }
            // A sub-block's segments are sent back-to-back with no
            // frame from the server in between; the caller keeps
            // pumping this arm (the inbound `msg` is irrelevant here)
            // until `is_self_driving` goes false.
            State::BlockWrite { .. } => self.send_next_block_segment(),
            State::AwaitBlockEndAck => {
                if cs != protocol::CS_BLOCK_RESP {
                    return Outcome::Aborted(CanOpenError::InvalidCommandSpecifier);
                }
                Outcome::Done
            }
        }
    }

    fn fit_local_buffer(&mut self, remote_len: usize) -> Result<(), CanOpenError> {
        let local_len = self.proxy.remaining();
        if remote_len == local_len {
            return Ok(());
        }
        if remote_len > local_len {
            if self.proxy.resize(remote_len) {
                Ok(())
            } else {
                Err(CanOpenError::ParamLengthLow)
            }
        } else if self.proxy.resize(remote_len) {
            Ok(())
        } else {
            Err(CanOpenError::ParamLengthHigh)
        }
    }

    fn send_next_segment(&mut self, toggle: bool) -> Outcome {
        let remaining = self.proxy.remaining();
        let chunk_len = remaining.min(7);
        let mut buf = [0u8; 7];
        if let Err(e) = self.proxy.copy_into(&mut buf[..chunk_len]) {
            return Outcome::Aborted(e);
        }
        let last = self.proxy.remaining() == 0;
        self.state = State::SegWrite { toggle };
        Outcome::Continue(protocol::download_segment_req(self.tx_cobid, toggle, &buf[..chunk_len], last))
    }

    /// Streams one sub-block of up to 127 segments, always at the fixed
    /// `BLOCK_SIZE`; the client never looks at the server's `blksize`
    /// byte. Every non-final segment carries exactly seven payload
    /// bytes; only the final segment's true byte count (1..=7) is
    /// reported separately, in the end-request frame.
    fn send_next_block_segment(&mut self) -> Outcome {
        let (seqno, remaining) = match &self.state {
            State::BlockWrite { seqno, remaining } => (*seqno, *remaining),
            _ => return Outcome::Aborted(CanOpenError::InternalError),
        };
        let chunk_len = remaining.min(7).max(1);
        let mut buf = [0u8; 7];
        if let Err(e) = self.proxy.copy_into(&mut buf[..chunk_len]) {
            return Outcome::Aborted(e);
        }
        let new_remaining = remaining - chunk_len;
        let is_final_segment = new_remaining == 0;
        let is_last_in_subblock = seqno == constants::BLOCK_SIZE || is_final_segment;
        let msg = protocol::block_segment(self.tx_cobid, seqno, is_last_in_subblock, &buf[..chunk_len]);
        if is_last_in_subblock {
            self.state = State::AwaitBlockAck { remaining: new_remaining, last_chunk_len: chunk_len };
        } else {
            self.state = State::BlockWrite { seqno: seqno + 1, remaining: new_remaining };
        }
        Outcome::Continue(msg)
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn sub_index(&self) -> u8 {
        self.sub_index
    }

    /// True while this transaction is mid-sub-block and must be pumped
    /// again without waiting for an inbound frame (see `State::BlockWrite`).
    pub fn is_self_driving(&self) -> bool {
        matches!(self.state, State::BlockWrite { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{OdValue, ObjectDictionary};
    use crate::sdo::server::{Outcome as ServerOutcome, ServerTransaction};
    use crate::types::Access;
    use alloc::string::{String, ToString};
    use alloc::vec::Vec;

    /// Feeds `req` into `client`, pumping any block-mode sub-block
    /// segments the client self-drives before returning its first
    /// outcome that actually needs the server's reply.
    fn client_step(client: &mut ClientTransaction, req: &Msg, server: &mut ServerTransaction, server_od: &mut ObjectDictionary) -> Option<Msg> {
        match client.process(req) {
            Outcome::Done => None,
            Outcome::Aborted(e) => panic!("client aborted: {:?}", e),
            Outcome::Continue(mut msg) => {
                loop {
                    match server.process(&msg, server_od) {
                        ServerOutcome::Silent => {
                            if !client.is_self_driving() {
                                return None;
                            }
                            match client.process(&msg) {
                                Outcome::Continue(next) => msg = next,
                                Outcome::Done => return None,
                                Outcome::Aborted(e) => panic!("client aborted: {:?}", e),
                            }
                        }
                        ServerOutcome::Continue(resp) | ServerOutcome::Done(resp) => return Some(resp),
                        ServerOutcome::Abort(resp) => panic!("server aborted: {:?}", resp.data),
                    }
                }
            }
        }
    }

    #[test]
    fn segmented_string_download_matches_source() {
        let text = "The quick brown fox jumps over the lazy dog";
        let mut client_od = ObjectDictionary::new();
        client_od.insert(0x2022, 0, Access::Rw, OdValue::Str(text.to_string())).unwrap();
        let mut server_od = ObjectDictionary::new();
        server_od.insert(0x2022, 0, Access::Rw, OdValue::Str(String::new())).unwrap();

        let (mut client, req) = ClientTransaction::initiate_write(0x2022, 0, 0x601, &mut client_od).unwrap();
        let (outcome, tx) = ServerTransaction::start(&req, 0x581, &mut server_od);
        let mut server = tx.expect("segmented download keeps a server transaction open");
        let mut next = match outcome {
            ServerOutcome::Continue(resp) => resp,
            ServerOutcome::Done(_) => panic!("expected a segmented download, got expedited"),
            _ => panic!("server rejected the initiate frame"),
        };
        loop {
            match client_step(&mut client, &next, &mut server, &mut server_od) {
                Some(resp) => next = resp,
                None => break,
            }
        }

        let OdValue::Str(got) = server_od.get_raw(0x2022, 0).unwrap() else {
            panic!("expected a string value");
        };
        assert_eq!(got, text);
    }

    #[test]
    fn block_mode_download_reassembles_large_buffer() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let mut client_od = ObjectDictionary::new();
        client_od.insert(0x2022, 0, Access::Rw, OdValue::Bytes(payload.clone())).unwrap();
        let mut server_od = ObjectDictionary::new();
        server_od.insert(0x2022, 0, Access::Rw, OdValue::Bytes(alloc::vec![0u8; 1000])).unwrap();

        let (mut client, req) = ClientTransaction::initiate_write(0x2022, 0, 0x601, &mut client_od).unwrap();
        let (outcome, tx) = ServerTransaction::start(&req, 0x581, &mut server_od);
        let mut server = tx.expect("block download keeps a server transaction open");
        let mut next = match outcome {
            ServerOutcome::Continue(resp) => resp,
            _ => panic!("expected a block initiate ack"),
        };
        loop {
            match client_step(&mut client, &next, &mut server, &mut server_od) {
                Some(resp) => next = resp,
                None => break,
            }
        }

        let OdValue::Bytes(got) = server_od.get_raw(0x2022, 0).unwrap() else {
            panic!("expected a byte buffer");
        };
        assert_eq!(got, payload);
    }
}
