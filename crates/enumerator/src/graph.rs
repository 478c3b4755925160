use crate::model::Tag;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::{Mutex, RwLock};
use tracing::warn;

// region:        --- Data operations

/// One graph mutation, mirrored to the data-operations writer as a JSON
/// line. Replaying a log of these records reconstructs the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DataOp {
    InsertName {
        name: String,
        domain: String,
        tag: Tag,
        source: String,
    },
    InsertCname {
        name: String,
        target: String,
    },
    InsertAddress {
        name: String,
        address: String,
    },
    InsertCidr {
        address: String,
        cidr: String,
    },
    InsertAsn {
        cidr: String,
        asn: u32,
        description: String,
    },
}

// endregion:     --- Data operations

// region:        --- Nodes

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameNode {
    pub domain: String,
    pub cname: Option<String>,
    pub addresses: BTreeSet<String>,
    pub sources: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsnNode {
    pub description: String,
    pub cidrs: BTreeSet<String>,
}

/// The committed state of the graph. Cloned out for comparisons in tests and
/// for offline inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphState {
    pub names: BTreeMap<String, NameNode>,
    /// address -> enclosing CIDR, when known
    pub addresses: BTreeMap<String, Option<String>>,
    /// cidr -> member addresses
    pub cidrs: BTreeMap<String, BTreeSet<String>>,
    pub asns: BTreeMap<u32, AsnNode>,
    pub sources: BTreeSet<String>,
}

// endregion:     --- Nodes

/// Append-only graph of names, addresses, CIDRs, ASNs and sources gathered
/// during one enumeration. Mutations are serialized by the data manager;
/// readers see committed edges only.
pub struct Graph {
    inner: RwLock<GraphState>,
    ops: Option<Mutex<Box<dyn Write + Send>>>,
}

impl Graph {
    pub fn new(ops_writer: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            inner: RwLock::new(GraphState::default()),
            ops: ops_writer.map(Mutex::new),
        }
    }

    /// Rebuild a graph from a data-operations log.
    pub fn replay(ops: impl IntoIterator<Item = DataOp>) -> Self {
        let graph = Self::new(None);
        for op in ops {
            match op {
                DataOp::InsertName {
                    name,
                    domain,
                    tag,
                    source,
                } => {
                    graph.insert_name(&name, &domain, tag, &source);
                }
                DataOp::InsertCname { name, target } => {
                    graph.insert_cname(&name, &target);
                }
                DataOp::InsertAddress { name, address } => {
                    graph.insert_address(&name, &address);
                }
                DataOp::InsertCidr { address, cidr } => {
                    graph.insert_cidr(&address, &cidr);
                }
                DataOp::InsertAsn {
                    cidr,
                    asn,
                    description,
                } => {
                    graph.insert_asn(&cidr, asn, &description);
                }
            }
        }
        graph
    }

    // region:    --- Mutations

    /// Insert a name node, returning true when the name was new.
    pub fn insert_name(&self, name: &str, domain: &str, tag: Tag, source: &str) -> bool {
        let mut inner = self.write();
        inner.sources.insert(source.to_string());
        let node = inner.names.entry(name.to_string()).or_default();
        let new = node.domain.is_empty();
        if new {
            node.domain = domain.to_string();
        }
        let new_edge = node.sources.insert(source.to_string());
        drop(inner);

        if new || new_edge {
            self.log_op(&DataOp::InsertName {
                name: name.to_string(),
                domain: domain.to_string(),
                tag,
                source: source.to_string(),
            });
        }
        new
    }

    /// Record a CNAME edge. A name keeps its first target; later conflicting
    /// inserts are ignored.
    pub fn insert_cname(&self, name: &str, target: &str) -> bool {
        let mut inner = self.write();
        let node = inner.names.entry(name.to_string()).or_default();
        if node.cname.is_some() {
            return false;
        }
        node.cname = Some(target.to_string());
        drop(inner);

        self.log_op(&DataOp::InsertCname {
            name: name.to_string(),
            target: target.to_string(),
        });
        true
    }

    /// Record an A/AAAA edge. The referenced address node is created with it.
    pub fn insert_address(&self, name: &str, address: &str) -> bool {
        let mut inner = self.write();
        inner.addresses.entry(address.to_string()).or_insert(None);
        let node = inner.names.entry(name.to_string()).or_default();
        let new = node.addresses.insert(address.to_string());
        drop(inner);

        if new {
            self.log_op(&DataOp::InsertAddress {
                name: name.to_string(),
                address: address.to_string(),
            });
        }
        new
    }

    /// Attach an address to its announced prefix.
    pub fn insert_cidr(&self, address: &str, cidr: &str) -> bool {
        let mut inner = self.write();
        inner.addresses.insert(address.to_string(), Some(cidr.to_string()));
        let new = inner
            .cidrs
            .entry(cidr.to_string())
            .or_default()
            .insert(address.to_string());
        drop(inner);

        if new {
            self.log_op(&DataOp::InsertCidr {
                address: address.to_string(),
                cidr: cidr.to_string(),
            });
        }
        new
    }

    /// Attach a prefix to its originating autonomous system.
    pub fn insert_asn(&self, cidr: &str, asn: u32, description: &str) -> bool {
        let mut inner = self.write();
        let node = inner.asns.entry(asn).or_default();
        if node.description.is_empty() {
            node.description = description.to_string();
        }
        let new = node.cidrs.insert(cidr.to_string());
        drop(inner);

        if new {
            self.log_op(&DataOp::InsertAsn {
                cidr: cidr.to_string(),
                asn,
                description: description.to_string(),
            });
        }
        new
    }

    // endregion: --- Mutations

    // region:    --- Reads

    pub fn has_name(&self, name: &str) -> bool {
        self.read().names.contains_key(name)
    }

    /// The CNAME target of a name, when one was recorded.
    pub fn cname_of(&self, name: &str) -> Option<String> {
        self.read().names.get(name).and_then(|n| n.cname.clone())
    }

    pub fn state(&self) -> GraphState {
        self.read().clone()
    }

    // endregion: --- Reads

    fn log_op(&self, op: &DataOp) {
        let Some(writer) = &self.ops else { return };
        let mut writer = writer.lock().expect("data ops writer lock poisoned");
        let line = match serde_json::to_string(op) {
            Ok(line) => line,
            Err(err) => {
                warn!("data ops record could not be serialized: {err}");
                return;
            }
        };
        if let Err(err) = writeln!(writer, "{line}") {
            warn!("data ops record could not be written: {err}");
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<GraphState> {
        self.inner.read().expect("graph lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<GraphState> {
        self.inner.write().expect("graph lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn populate(graph: &Graph) {
        graph.insert_name("www.example.com", "example.com", Tag::Scrape, "DNSTable");
        graph.insert_name("www.example.com", "example.com", Tag::Cert, "Crtsh");
        graph.insert_cname("alias.example.com", "www.example.com");
        graph.insert_address("www.example.com", "93.184.216.34");
        graph.insert_cidr("93.184.216.34", "93.184.216.0/24");
        graph.insert_asn("93.184.216.0/24", 15133, "EDGECAST");
    }

    #[test]
    fn addresses_referenced_by_name_edges_exist() {
        let graph = Graph::new(None);
        graph.insert_address("www.example.com", "93.184.216.34");
        assert!(graph.state().addresses.contains_key("93.184.216.34"));
    }

    #[test]
    fn a_name_keeps_a_single_cname_target() {
        let graph = Graph::new(None);
        assert!(graph.insert_cname("alias.example.com", "www.example.com"));
        assert!(!graph.insert_cname("alias.example.com", "other.example.com"));
        assert_eq!(
            graph.cname_of("alias.example.com").as_deref(),
            Some("www.example.com")
        );
    }

    #[test]
    fn duplicate_mutations_write_no_extra_ops() {
        let buf = SharedBuf::default();
        let graph = Graph::new(Some(Box::new(buf.clone())));
        graph.insert_address("www.example.com", "93.184.216.34");
        graph.insert_address("www.example.com", "93.184.216.34");

        let bytes = buf.0.lock().unwrap();
        let lines = std::str::from_utf8(&bytes).unwrap().lines().count();
        assert_eq!(lines, 1);
    }

    #[test]
    fn replaying_the_ops_log_reconstructs_the_graph() {
        let buf = SharedBuf::default();
        let graph = Graph::new(Some(Box::new(buf.clone())));
        populate(&graph);

        let bytes = buf.0.lock().unwrap();
        let ops: Vec<DataOp> = std::str::from_utf8(&bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        let rebuilt = Graph::replay(ops);
        assert_eq!(rebuilt.state(), graph.state());
    }
}
