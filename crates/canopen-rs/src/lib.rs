#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod bus;
pub mod clock;
pub mod emcy;
pub mod error;
pub mod nmt;
pub mod node;
pub mod od;
pub mod pdo;
pub mod sdo;
pub mod types;

pub use bus::Bus;
pub use clock::{Clock, Generation, TimerHandle};
pub use emcy::{EmcyService, ErrorType};
pub use error::{CanOpenError, Result};
pub use nmt::{NmtService, NodeState};
pub use node::{LocalNode, NodeConfig};
pub use od::{ObjectDictionary, OdProxy, OdValue};
pub use pdo::{PdoMappingEntry, PdoService};
pub use sdo::SdoService;
pub use types::{Access, FunctionCode, Msg};
