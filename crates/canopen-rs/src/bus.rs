//! The CAN bus collaborator. Deliberately out of scope: this
//! crate only declares the interface a platform adapter implements.

use crate::error::Result;
use crate::types::Msg;

/// Sends frames to, and is polled for frames received from, the physical
/// CAN bus. Implementations live in platform crates (e.g. a SocketCAN
/// adapter); `canopen-rs` never talks to hardware directly.
pub trait Bus {
    /// Sends a frame. `async_send` permits the implementation to enqueue
    /// the frame and return before it is physically on the wire.
    fn write(&mut self, msg: &Msg, async_send: bool) -> Result<()>;

    /// Sends a frame ahead of any queued non-priority traffic, for
    /// services (abort frames, EMCY) that should not wait behind a queue.
    /// Implementations that do not distinguish priority may just forward
    /// to `write`.
    fn write_priority(&mut self, msg: &Msg) -> Result<()> {
        self.write(msg, false)
    }
}
