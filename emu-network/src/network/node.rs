use crate::network::device::DeviceId;
use std::fmt::{Display, Formatter};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) devices: Vec<DeviceId>,
    pub(crate) ip_forwarding: bool,
}

impl Node {
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            devices: Vec::new(),
            ip_forwarding: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's devices, in creation order
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn ip_forwarding(&self) -> bool {
        self.ip_forwarding
    }
}
