//! SDO command-specifier byte layout. Framing helpers shared
//! by the client and server state machines, expressed as free
//! functions over an 8-byte frame.

use crate::error::CanOpenError;
use crate::types::Msg;

pub const CS_DOWNLOAD_SEGMENT_REQ: u8 = 0;
pub const CS_UPLOAD_INITIATE_REQ: u8 = 2;
pub const CS_UPLOAD_SEGMENT_REQ: u8 = 3;
pub const CS_DOWNLOAD_INITIATE_REQ: u8 = 1;
pub const CS_BLOCK_REQ: u8 = 6;
pub const CS_UPLOAD_SEGMENT_RESP: u8 = 0;
pub const CS_DOWNLOAD_SEGMENT_RESP: u8 = 1;
pub const CS_UPLOAD_INITIATE_RESP: u8 = 2;
pub const CS_DOWNLOAD_INITIATE_RESP: u8 = 3;
pub const CS_ABORT: u8 = 4;
pub const CS_BLOCK_RESP: u8 = 5;

pub const BLOCK_SUB_INITIATE: u8 = 1;
pub const BLOCK_SUB_ACK: u8 = 2;

/// Builds an 8-byte SDO abort frame.
pub fn abort_frame(cobid: u32, index: u16, sub_index: u8, code: u32) -> Msg {
    let mut data = [0u8; 8];
    data[0] = CS_ABORT << 5;
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub_index;
    data[4..8].copy_from_slice(&code.to_le_bytes());
    Msg::new(cobid, &data)
}

pub fn parse_abort(msg: &Msg) -> Option<(u16, u8, u32)> {
    if msg.data.len() != 8 || (msg.data[0] >> 5) != CS_ABORT {
        return None;
    }
    let index = u16::from_le_bytes([msg.data[1], msg.data[2]]);
    let sub_index = msg.data[3];
    let code = u32::from_le_bytes([msg.data[4], msg.data[5], msg.data[6], msg.data[7]]);
    Some((index, sub_index, code))
}

/// Builds an expedited upload-initiate response: `cs = 2<<5 | (4-len)<<2 | 0b11`.
pub fn upload_initiate_expedited(cobid: u32, index: u16, sub_index: u8, payload: &[u8]) -> Msg {
    debug_assert!(payload.len() <= 4);
    let mut data = [0u8; 8];
    let n_empty = (4 - payload.len()) as u8;
    data[0] = (CS_UPLOAD_INITIATE_RESP << 5) | (n_empty << 2) | 0b11;
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub_index;
    data[4..4 + payload.len()].copy_from_slice(payload);
    Msg::new(cobid, &data)
}

/// Builds a segmented upload-initiate response advertising `total_len`.
pub fn upload_initiate_segmented(cobid: u32, index: u16, sub_index: u8, total_len: u32) -> Msg {
    let mut data = [0u8; 8];
    data[0] = (CS_UPLOAD_INITIATE_RESP << 5) | 0b01;
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub_index;
    data[4..8].copy_from_slice(&total_len.to_le_bytes());
    Msg::new(cobid, &data)
}

/// Builds the download-initiate request frame used by a client.
pub fn download_initiate(cobid: u32, index: u16, sub_index: u8, payload: &[u8], total_len: Option<u32>) -> Msg {
    let mut data = [0u8; 8];
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub_index;
    if let Some(len) = total_len {
        // es = 0b01, segmented: length in bytes 4..8, no payload yet.
        data[0] = (CS_DOWNLOAD_INITIATE_REQ << 5) | 0b01;
        data[4..8].copy_from_slice(&len.to_le_bytes());
    } else {
        debug_assert!(payload.len() <= 4);
        let n_empty = (4 - payload.len()) as u8;
        data[0] = (CS_DOWNLOAD_INITIATE_REQ << 5) | (n_empty << 2) | 0b11;
        data[4..4 + payload.len()].copy_from_slice(payload);
    }
    Msg::new(cobid, &data)
}

pub fn download_initiate_response(cobid: u32, index: u16, sub_index: u8) -> Msg {
    let mut data = [0u8; 8];
    data[0] = CS_DOWNLOAD_INITIATE_RESP << 5;
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub_index;
    Msg::new(cobid, &data)
}

/// Builds an upload-segment request. `toggle` alternates starting at 0.
pub fn upload_segment_req(cobid: u32, toggle: bool) -> Msg {
    let data = [(CS_UPLOAD_SEGMENT_REQ << 5) | ((toggle as u8) << 4), 0, 0, 0, 0, 0, 0, 0];
    Msg::new(cobid, &data)
}

/// Builds an upload-segment response carrying up to 7 payload bytes.
pub fn upload_segment_resp(cobid: u32, toggle: bool, chunk: &[u8], last: bool) -> Msg {
    debug_assert!(chunk.len() <= 7);
    let mut data = [0u8; 8];
    let n_empty = (7 - chunk.len()) as u8;
    data[0] = (CS_UPLOAD_SEGMENT_RESP << 5) | ((toggle as u8) << 4) | (n_empty << 1) | (last as u8);
    data[1..1 + chunk.len()].copy_from_slice(chunk);
    Msg::new(cobid, &data)
}

/// Builds a download-segment request carrying up to 7 payload bytes.
pub fn download_segment_req(cobid: u32, toggle: bool, chunk: &[u8], last: bool) -> Msg {
    debug_assert!(chunk.len() <= 7);
    let mut data = [0u8; 8];
    let n_empty = (7 - chunk.len()) as u8;
    data[0] = (CS_DOWNLOAD_SEGMENT_REQ << 5) | ((toggle as u8) << 4) | (n_empty << 1) | (last as u8);
    data[1..1 + chunk.len()].copy_from_slice(chunk);
    Msg::new(cobid, &data)
}

pub fn download_segment_resp(cobid: u32, toggle: bool) -> Msg {
    let data = [(CS_DOWNLOAD_SEGMENT_RESP << 5) | ((toggle as u8) << 4), 0, 0, 0, 0, 0, 0, 0];
    Msg::new(cobid, &data)
}

/// Builds a block-download initiate request, used by the client when
/// `payload.len() >= BLOCK_MODE_THRESHOLD`.
pub fn block_download_initiate(cobid: u32, index: u16, sub_index: u8, total_len: u32) -> Msg {
    let mut data = [0u8; 8];
    data[0] = (CS_BLOCK_REQ << 5) | (BLOCK_SUB_INITIATE << 1);
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub_index;
    data[4..8].copy_from_slice(&total_len.to_le_bytes());
    Msg::new(cobid, &data)
}

pub fn block_download_initiate_response(cobid: u32, index: u16, sub_index: u8, blksize: u8) -> Msg {
    let mut data = [0u8; 8];
    data[0] = (CS_BLOCK_RESP << 5) | (BLOCK_SUB_INITIATE << 1);
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub_index;
    data[4] = blksize;
    Msg::new(cobid, &data)
}

/// Builds a block sub-block segment: `byte0 = (last<<7)|seqno`.
pub fn block_segment(cobid: u32, seqno: u8, last: bool, chunk: &[u8]) -> Msg {
    debug_assert!(chunk.len() <= 7 && seqno >= 1 && seqno <= 127);
    let mut data = [0u8; 8];
    data[0] = ((last as u8) << 7) | seqno;
    data[1..1 + chunk.len()].copy_from_slice(chunk);
    Msg::new(cobid, &data)
}

pub fn block_ack(cobid: u32, ack_seqno: u8, next_blksize: u8) -> Msg {
    let data = [(CS_BLOCK_RESP << 5) | BLOCK_SUB_ACK, ack_seqno, next_blksize, 0, 0, 0, 0, 0];
    Msg::new(cobid, &data)
}

/// Builds the block-download end request: `cs = 6<<5 | (7-last_bytes)<<2 | 1`.
pub fn block_end_req(cobid: u32, last_bytes: u8) -> Msg {
    let data = [(CS_BLOCK_REQ << 5) | ((7 - last_bytes) << 2) | 1, 0, 0, 0, 0, 0, 0, 0];
    Msg::new(cobid, &data)
}

pub fn block_end_resp(cobid: u32) -> Msg {
    let data = [(CS_BLOCK_RESP << 5) | 1, 0, 0, 0, 0, 0, 0, 0];
    Msg::new(cobid, &data)
}

pub fn cs_code(byte0: u8) -> u8 {
    byte0 >> 5
}

pub fn require_len8(msg: &Msg) -> Result<(), CanOpenError> {
    if msg.data.len() != 8 {
        Err(CanOpenError::ParamLengthMismatch)
    } else {
        Ok(())
    }
}
