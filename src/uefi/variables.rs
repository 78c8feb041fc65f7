//! EFI variables, kept in host memory for the life of the process.

use std::collections::BTreeMap;

use super::Guid;

/// One stored variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub attributes: u32,
    pub data: Vec<u8>,
}

/// Variables keyed by `"<Name>:<GUID>"`.
#[derive(Debug, Default)]
pub struct VariableStore {
    vars: BTreeMap<String, (String, Guid, Variable)>,
}

/// Storage numbers reported by QueryVariableInfo.
pub const MAX_STORAGE: u64 = 0x1_0000;
pub const MAX_VARIABLE_SIZE: u64 = 0x1000;

fn key(name: &str, guid: &Guid) -> String {
    format!("{}:{}", name, guid)
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str, guid: &Guid) -> Option<&Variable> {
        self.vars.get(&key(name, guid)).map(|(_, _, v)| v)
    }

    /// Store a variable; empty data deletes it. Returns false when deleting
    /// something that does not exist.
    pub fn set(&mut self, name: &str, guid: &Guid, attributes: u32, data: &[u8]) -> bool {
        let k = key(name, guid);
        if data.is_empty() {
            return self.vars.remove(&k).is_some();
        }
        self.vars.insert(
            k,
            (
                name.to_string(),
                *guid,
                Variable {
                    attributes,
                    data: data.to_vec(),
                },
            ),
        );
        true
    }

    /// The variable after `(name, guid)` in key order; an empty name starts
    /// the walk.
    pub fn next_name(&self, name: &str, guid: &Guid) -> Option<(&str, Guid)> {
        let mut iter: Box<dyn Iterator<Item = _>> = if name.is_empty() {
            Box::new(self.vars.values())
        } else {
            let k = key(name, guid);
            Box::new(
                self.vars
                    .range::<String, _>((std::ops::Bound::Excluded(&k), std::ops::Bound::Unbounded))
                    .map(|(_, v)| v),
            )
        };
        iter.next().map(|(n, g, _)| (n.as_str(), *g))
    }

    /// Bytes used by stored names and data.
    pub fn used(&self) -> u64 {
        self.vars
            .values()
            .map(|(n, _, v)| (n.len() * 2 + 2 + v.data.len()) as u64)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uefi::guid::GLOBAL_VARIABLE;

    #[test]
    fn test_set_get_delete() {
        let mut store = VariableStore::new();
        assert!(store.set("BootOrder", &GLOBAL_VARIABLE, 7, &[1, 0]));
        let v = store.get("BootOrder", &GLOBAL_VARIABLE).unwrap();
        assert_eq!(v.attributes, 7);
        assert_eq!(v.data, vec![1, 0]);

        assert!(store.set("BootOrder", &GLOBAL_VARIABLE, 7, &[]));
        assert!(store.get("BootOrder", &GLOBAL_VARIABLE).is_none());
        assert!(!store.set("BootOrder", &GLOBAL_VARIABLE, 7, &[]));
    }

    #[test]
    fn test_walk_names() {
        let mut store = VariableStore::new();
        store.set("B", &GLOBAL_VARIABLE, 0, b"x");
        store.set("A", &GLOBAL_VARIABLE, 0, b"y");

        let (first, g) = store.next_name("", &GLOBAL_VARIABLE).unwrap();
        assert_eq!(first, "A");
        let first = first.to_string();
        let (second, _) = store.next_name(&first, &g).unwrap();
        assert_eq!(second, "B");
        assert!(store.next_name("B", &GLOBAL_VARIABLE).is_none());
    }
}
