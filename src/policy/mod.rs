//! Declarative policy: the snapshot, its wire document, and the shared state.
//!
//! Control flows one way: the management server pushes a [`PolicyDocument`],
//! it is folded into a new [`PolicySnapshot`], and the snapshot is published
//! through [`PolicyState`] to every controller.

mod document;
mod snapshot;
mod state;

pub use document::{NetworkSection, PolicyDocument, UploadsSection, UsbSection};
pub use snapshot::{
    normalize_domain, normalize_hash, BlockingMethod, PolicySnapshot, UsbMode, WhitelistRule,
};
pub use state::PolicyState;
