//! Session envelope: the messages exchanged around the module inventory.

use serde::{Deserialize, Serialize};

use crate::negotiation::RejectReason;

/// Envelope version. Carried in `Hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// All envelope message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Encoded module inventory. Always the first frame on a new connection.
    ModuleInventory { payload: Vec<u8> },
    /// Rest of the handshake: identify the peer.
    Hello { protocol_version: u32, name: String },
    /// Host's decision. `report` is the rendered diagnostic on rejection.
    Verdict {
        accepted: bool,
        reason: Option<RejectReason>,
        report: Option<String>,
    },
}
