//! Module compatibility negotiation between a host and a joining participant.
//! Host-driven: no I/O; the host application passes connection events in and performs
//! the returned actions.

pub mod codec;
pub mod compat;
pub mod descriptor;
pub mod inventory;
pub mod negotiation;
pub mod package;
pub mod protocol;
pub mod wire;

pub use codec::{decode, encode, DecodeError, EncodeError};
pub use compat::{compare, CompatibilityReport, Finding, Side};
pub use descriptor::{
    EnforcementLevel, ModuleDescriptor, ModuleVersion, Role, VersionStrictness, LAYOUT_VERSION,
    MAX_SUPPORTED_LAYOUT,
};
pub use inventory::{HostInfo, ModuleInventory, ModuleRecord, ModuleSource};
pub use negotiation::{
    Diagnostic, NegotiationAction, NegotiationError, NegotiationState, Negotiator,
    PeerInventories, RejectReason, RetentionPolicy, Verdict,
};
pub use package::{Package, PackageError};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
