//! Emergency (EMCY) notification service: an error-register bit per
//! `ErrorType`, a per-code history count so multiple concurrent causes
//! of the same error code don't clear each other's bit, and a single
//! registered listener callback for inbound frames.

use crate::bus::Bus;
use crate::error::Result;
use crate::od::{constants, ObjectDictionary};
use crate::types::{cob, Msg};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use log::warn;

/// Error-register bits, `CiA 301` table 12.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorType {
    Generic = 1 << 0,
    Current = 1 << 1,
    Voltage = 1 << 2,
    Temperature = 1 << 3,
    Communication = 1 << 4,
    ProfileSpecific = 1 << 5,
    Reserved = 1 << 6,
    ManufacturerSpecific = 1 << 7,
}

type EmcyCallback = Box<dyn FnMut(u8, u16, [u8; 5]) + Send>;

/// Tracks the error register and per-code occurrence counts, and emits
/// or consumes EMCY frames on `0x080+node_id`.
pub struct EmcyService {
    node_id: u8,
    error_history: BTreeMap<u16, usize>,
    callback: Option<EmcyCallback>,
}

impl EmcyService {
    pub fn new(node_id: u8) -> Self {
        EmcyService { node_id, error_history: BTreeMap::new(), callback: None }
    }

    fn set_error_reg(&self, error_type: ErrorType, od: &mut ObjectDictionary) -> Result<u8> {
        let reg = od.get_u8(constants::IDX_ERROR_REGISTER, 0)?;
        let reg = reg | error_type as u8;
        od.set_u8(constants::IDX_ERROR_REGISTER, 0, reg)?;
        Ok(reg)
    }

    fn clear_error_reg(&self, error_type: ErrorType, od: &mut ObjectDictionary) -> Result<u8> {
        let reg = od.get_u8(constants::IDX_ERROR_REGISTER, 0)?;
        let reg = reg & !(error_type as u8);
        od.set_u8(constants::IDX_ERROR_REGISTER, 0, reg)?;
        Ok(reg)
    }

    /// Sets the `error_type` bit in `0x1001`, bumps `error`'s history
    /// count, and emits the EMCY frame
    /// `[err_lo, err_hi, error_reg, specific[0..5]]`.
    pub fn send_emcy(&mut self, error: u16, specific: [u8; 5], error_type: ErrorType, od: &mut ObjectDictionary, bus: &mut dyn Bus) -> Result<()> {
        let error_reg = self.set_error_reg(error_type, od)?;
        let mut data = [0u8; 8];
        data[0] = (error & 0xFF) as u8;
        data[1] = (error >> 8) as u8;
        data[2] = error_reg;
        data[3..8].copy_from_slice(&specific);
        *self.error_history.entry(error).or_insert(0) += 1;
        bus.write(&Msg::new(cob::emcy(self.node_id), &data), true)
    }

    /// Decrements `error`'s history count; once it reaches zero, clears
    /// `error_type`'s bit, and if the whole register is now zero sends
    /// the all-zero "no error" frame.
    pub fn clear_emcy(&mut self, error: u16, error_type: ErrorType, od: &mut ObjectDictionary, bus: &mut dyn Bus) -> Result<()> {
        let Some(count) = self.error_history.get_mut(&error) else {
            return Ok(());
        };
        *count -= 1;
        if *count != 0 {
            return Ok(());
        }
        self.error_history.remove(&error);
        let error_reg = self.clear_error_reg(error_type, od)?;
        if error_reg == 0 {
            return bus.write(&Msg::new(cob::emcy(self.node_id), &[0u8; 8]), true);
        }
        Ok(())
    }

    /// Registers the single EMCY listener slot. Only one subscriber is
    /// supported at a time; a second call replaces the first.
    pub fn register_callback(&mut self, cb: EmcyCallback) {
        self.callback = Some(cb);
    }

    /// Processes an inbound EMCY frame, `cob_id` carrying the sender's
    /// node id as its low byte. Drops malformed frames (wrong length or
    /// RTR) with a warning.
    pub fn process_msg(&mut self, node: u8, msg: &Msg) {
        if msg.data.len() != 8 || msg.rtr {
            warn!("invalid EMCY frame from node {} (len {}, rtr {})", node, msg.data.len(), msg.rtr);
            return;
        }
        let error = (msg.data[1] as u16) << 8 | msg.data[0] as u16;
        let mut specific = [0u8; 5];
        specific.copy_from_slice(&msg.data[3..8]);
        if let Some(cb) = self.callback.as_mut() {
            cb(node, error, specific);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Access;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, Ordering};

    struct RecordingBus {
        sent: Vec<Msg>,
    }
    impl Bus for RecordingBus {
        fn write(&mut self, msg: &Msg, _async_send: bool) -> Result<()> {
            self.sent.push(msg.clone());
            Ok(())
        }
    }

    fn od_with_error_register() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(constants::IDX_ERROR_REGISTER, 0, Access::Rw, crate::od::OdValue::U8(0)).unwrap();
        od
    }

    #[test]
    fn send_emcy_sets_error_register_bit_and_frame() {
        let mut od = od_with_error_register();
        let mut bus = RecordingBus { sent: Vec::new() };
        let mut emcy = EmcyService::new(5);
        emcy.send_emcy(0x1000, [1, 2, 3, 4, 5], ErrorType::Temperature, &mut od, &mut bus).unwrap();
        assert_eq!(od.get_u8(constants::IDX_ERROR_REGISTER, 0).unwrap(), ErrorType::Temperature as u8);
        assert_eq!(bus.sent.len(), 1);
        let frame = &bus.sent[0];
        assert_eq!(frame.id, cob::emcy(5));
        assert_eq!(&frame.data[0..3], &[0x00, 0x10, ErrorType::Temperature as u8]);
        assert_eq!(&frame.data[3..8], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn clear_emcy_clears_bit_and_sends_no_error_frame_when_last() {
        let mut od = od_with_error_register();
        let mut bus = RecordingBus { sent: Vec::new() };
        let mut emcy = EmcyService::new(5);
        emcy.send_emcy(0x2000, [0; 5], ErrorType::Voltage, &mut od, &mut bus).unwrap();
        emcy.clear_emcy(0x2000, ErrorType::Voltage, &mut od, &mut bus).unwrap();
        assert_eq!(od.get_u8(constants::IDX_ERROR_REGISTER, 0).unwrap(), 0);
        assert_eq!(bus.sent.len(), 2);
        assert_eq!(bus.sent[1].data, [0u8; 8]);
    }

    #[test]
    fn process_msg_invokes_callback() {
        let mut emcy = EmcyService::new(5);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        emcy.register_callback(Box::new(move |node, error, specific| {
            assert_eq!(node, 3);
            assert_eq!(error, 0x1234);
            assert_eq!(specific, [1, 2, 3, 4, 5]);
            fired2.store(true, Ordering::SeqCst);
        }));
        let msg = Msg::new(cob::emcy(3), &[0x34, 0x12, 0, 1, 2, 3, 4, 5]);
        emcy.process_msg(3, &msg);
        assert!(fired.load(Ordering::SeqCst));
    }
}
