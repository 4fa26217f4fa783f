use crate::network::frame::{Datagram, FiveTuple};
use std::collections::{BTreeMap, HashMap};

/// Maps IPv4 5-tuples to flow ids, handed out sequentially starting at 1
#[derive(Debug, Default)]
pub struct Ipv4FlowClassifier {
    ids: HashMap<FiveTuple, u32>,
    flows: Vec<ClassifiedFlow>,
}

#[derive(Clone, Debug)]
pub struct ClassifiedFlow {
    pub id: u32,
    pub tuple: FiveTuple,
    /// Packets seen per DSCP value
    pub dscp_packets: BTreeMap<u8, u64>,
}

impl Ipv4FlowClassifier {
    /// Returns the id of the flow `datagram` belongs to, creating the flow if needed
    pub fn classify(&mut self, datagram: &Datagram) -> u32 {
        let tuple = datagram.five_tuple();
        let id = match self.ids.get(&tuple) {
            Some(&id) => id,
            None => {
                let id = self.flows.len() as u32 + 1;
                self.ids.insert(tuple, id);
                self.flows.push(ClassifiedFlow {
                    id,
                    tuple,
                    dscp_packets: BTreeMap::new(),
                });
                id
            }
        };

        let flow = &mut self.flows[id as usize - 1];
        *flow.dscp_packets.entry(datagram.dscp()).or_default() += 1;
        id
    }

    pub fn find_flow(&self, id: u32) -> Option<&ClassifiedFlow> {
        self.flows.get((id as usize).checked_sub(1)?)
    }

    /// Every known flow, ordered by id
    pub fn flows(&self) -> &[ClassifiedFlow] {
        &self.flows
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::frame::udp_datagram;

    #[test]
    fn test_flow_ids_are_sequential_per_tuple() {
        let mut classifier = Ipv4FlowClassifier::default();
        let a = udp_datagram(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.1.1:2000".parse().unwrap(),
            b"a",
            64,
        );
        let b = udp_datagram(
            "10.0.1.1:2000".parse().unwrap(),
            "10.0.0.1:1000".parse().unwrap(),
            b"b",
            64,
        );

        assert_eq!(classifier.classify(&a), 1);
        assert_eq!(classifier.classify(&b), 2);
        assert_eq!(classifier.classify(&a), 1);

        let flow = classifier.find_flow(1).unwrap();
        assert_eq!(flow.tuple.source_port, 1000);
        assert_eq!(flow.dscp_packets.get(&0), Some(&2));
        assert!(classifier.find_flow(0).is_none());
        assert!(classifier.find_flow(3).is_none());
    }
}
