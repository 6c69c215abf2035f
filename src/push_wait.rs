//! Component D: parked long-poll responses (§4.D). A `PushEntry` is a
//! continuation value, not a suspended task (§9): a response handle plus
//! a pre-filled envelope and the offset the parked poll had reached, to
//! be completed synchronously by the writer-side wake path.

use crate::collab::{ResponseEnvelope, RpcHandle};
use crate::data::Offset;

pub struct PushEntry {
    pub rpc: Box<dyn RpcHandle>,
    pub envelope: ResponseEnvelope,
    /// The offset the parked poll had reached; the wake path resumes a
    /// scan from here.
    pub base_offset: Offset,
}

impl PushEntry {
    pub fn new(rpc: Box<dyn RpcHandle>, envelope: ResponseEnvelope, base_offset: Offset) -> Self {
        Self { rpc, envelope, base_offset }
    }
}
