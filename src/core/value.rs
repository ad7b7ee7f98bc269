//! CRDT value variants.
//!
//! One enum realises the polymorphic CRDT capabilities instead of a type
//! hierarchy: every variant applies updates commutatively, so replaying the
//! same set of operations in any order converges.

use std::collections::{BTreeMap, BTreeSet};

use minicbor::{Decode, Encode};
use thiserror::Error;

use super::id::CrdtKind;
use super::op::{CrdtOp, UpdateTag};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("operation {op_kind} cannot apply to {value_kind} value")]
pub struct KindMismatch {
    pub op_kind: CrdtKind,
    pub value_kind: CrdtKind,
}

/// Last-writer-wins cell used by registers and directory entries. `None`
/// value marks a removal tombstone.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct LwwCell {
    #[n(0)]
    pub tag: UpdateTag,
    #[n(1)]
    pub value: Option<String>,
}

impl LwwCell {
    fn assign(&mut self, tag: UpdateTag, value: Option<String>) {
        if tag > self.tag {
            self.tag = tag;
            self.value = value;
        }
    }
}

/// The state of one replicated object.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum CrdtValue {
    #[n(0)]
    Counter(#[n(0)] i64),
    #[n(1)]
    Register(#[n(0)] Option<LwwCell>),
    /// Add-wins set: an element is present while it owns at least one live
    /// add tag. Removes cover only the tags they observed.
    #[n(2)]
    Set(#[n(0)] BTreeMap<String, BTreeSet<UpdateTag>>),
    /// Map of key to LWW cell with removal tombstones.
    #[n(3)]
    Directory(#[n(0)] BTreeMap<String, LwwCell>),
}

impl CrdtValue {
    pub fn new(kind: CrdtKind) -> Self {
        match kind {
            CrdtKind::Counter => CrdtValue::Counter(0),
            CrdtKind::Register => CrdtValue::Register(None),
            CrdtKind::Set => CrdtValue::Set(BTreeMap::new()),
            CrdtKind::Directory => CrdtValue::Directory(BTreeMap::new()),
        }
    }

    pub fn kind(&self) -> CrdtKind {
        match self {
            CrdtValue::Counter(_) => CrdtKind::Counter,
            CrdtValue::Register(_) => CrdtKind::Register,
            CrdtValue::Set(_) => CrdtKind::Set,
            CrdtValue::Directory(_) => CrdtKind::Directory,
        }
    }

    pub fn apply(&mut self, op: &CrdtOp) -> Result<(), KindMismatch> {
        match (self, op) {
            (CrdtValue::Counter(total), CrdtOp::CounterAdd { delta }) => {
                *total = total.wrapping_add(*delta);
            }
            (CrdtValue::Register(cell), CrdtOp::RegisterWrite { tag, value }) => match cell {
                Some(current) => current.assign(tag.clone(), Some(value.clone())),
                None => {
                    *cell = Some(LwwCell {
                        tag: tag.clone(),
                        value: Some(value.clone()),
                    });
                }
            },
            (CrdtValue::Set(elements), CrdtOp::SetAdd { element, tag }) => {
                elements.entry(element.clone()).or_default().insert(tag.clone());
            }
            (CrdtValue::Set(elements), CrdtOp::SetRemove { element, tags }) => {
                if let Some(live) = elements.get_mut(element) {
                    live.retain(|tag| !tags.contains(tag));
                    if live.is_empty() {
                        elements.remove(element);
                    }
                }
            }
            (CrdtValue::Directory(entries), CrdtOp::DirectoryPut { key, tag, value }) => {
                match entries.get_mut(key) {
                    Some(cell) => cell.assign(tag.clone(), Some(value.clone())),
                    None => {
                        entries.insert(
                            key.clone(),
                            LwwCell {
                                tag: tag.clone(),
                                value: Some(value.clone()),
                            },
                        );
                    }
                }
            }
            (CrdtValue::Directory(entries), CrdtOp::DirectoryRemove { key, tag }) => {
                match entries.get_mut(key) {
                    Some(cell) => cell.assign(tag.clone(), None),
                    None => {
                        entries.insert(
                            key.clone(),
                            LwwCell {
                                tag: tag.clone(),
                                value: None,
                            },
                        );
                    }
                }
            }
            (value, op) => {
                return Err(KindMismatch {
                    op_kind: op.kind(),
                    value_kind: value.kind(),
                });
            }
        }
        Ok(())
    }

    pub fn counter_value(&self) -> Option<i64> {
        match self {
            CrdtValue::Counter(total) => Some(*total),
            _ => None,
        }
    }

    pub fn register_value(&self) -> Option<Option<&str>> {
        match self {
            CrdtValue::Register(cell) => {
                Some(cell.as_ref().and_then(|c| c.value.as_deref()))
            }
            _ => None,
        }
    }

    pub fn set_elements(&self) -> Option<impl Iterator<Item = &str>> {
        match self {
            CrdtValue::Set(elements) => Some(elements.keys().map(String::as_str)),
            _ => None,
        }
    }

    pub fn set_tags(&self, element: &str) -> Option<&BTreeSet<UpdateTag>> {
        match self {
            CrdtValue::Set(elements) => elements.get(element),
            _ => None,
        }
    }

    pub fn directory_get(&self, key: &str) -> Option<Option<&str>> {
        match self {
            CrdtValue::Directory(entries) => Some(
                entries
                    .get(key)
                    .and_then(|cell| cell.value.as_deref()),
            ),
            _ => None,
        }
    }

    pub fn directory_keys(&self) -> Option<impl Iterator<Item = &str>> {
        match self {
            CrdtValue::Directory(entries) => Some(
                entries
                    .iter()
                    .filter(|(_, cell)| cell.value.is_some())
                    .map(|(key, _)| key.as_str()),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::timestamp::{SourceId, Timestamp};

    fn tag(source: &str, counter: u64, seq: u32) -> UpdateTag {
        UpdateTag::new(Timestamp::new(SourceId::parse(source).unwrap(), counter), seq)
    }

    #[test]
    fn counter_accumulates_deltas_in_any_order() {
        let mut a = CrdtValue::new(CrdtKind::Counter);
        let mut b = CrdtValue::new(CrdtKind::Counter);
        let ops = [
            CrdtOp::CounterAdd { delta: 5 },
            CrdtOp::CounterAdd { delta: -2 },
            CrdtOp::CounterAdd { delta: 10 },
        ];
        for op in &ops {
            a.apply(op).unwrap();
        }
        for op in ops.iter().rev() {
            b.apply(op).unwrap();
        }
        assert_eq!(a.counter_value(), Some(13));
        assert_eq!(a, b);
    }

    #[test]
    fn register_is_last_writer_wins_regardless_of_arrival_order() {
        let early = CrdtOp::RegisterWrite {
            tag: tag("a", 1, 0),
            value: "old".into(),
        };
        let late = CrdtOp::RegisterWrite {
            tag: tag("b", 2, 0),
            value: "new".into(),
        };

        let mut forward = CrdtValue::new(CrdtKind::Register);
        forward.apply(&early).unwrap();
        forward.apply(&late).unwrap();

        let mut backward = CrdtValue::new(CrdtKind::Register);
        backward.apply(&late).unwrap();
        backward.apply(&early).unwrap();

        assert_eq!(forward.register_value(), Some(Some("new")));
        assert_eq!(forward, backward);
    }

    #[test]
    fn set_add_wins_over_concurrent_remove() {
        let mut set = CrdtValue::new(CrdtKind::Set);
        let t1 = tag("a", 1, 0);
        set.apply(&CrdtOp::SetAdd {
            element: "x".into(),
            tag: t1.clone(),
        })
        .unwrap();

        // Concurrent re-add under a tag the remove did not observe.
        let t2 = tag("b", 1, 0);
        set.apply(&CrdtOp::SetAdd {
            element: "x".into(),
            tag: t2,
        })
        .unwrap();
        set.apply(&CrdtOp::SetRemove {
            element: "x".into(),
            tags: [t1].into_iter().collect(),
        })
        .unwrap();

        assert!(set.set_tags("x").is_some());
    }

    #[test]
    fn set_remove_of_all_observed_tags_deletes_element() {
        let mut set = CrdtValue::new(CrdtKind::Set);
        let t1 = tag("a", 1, 0);
        set.apply(&CrdtOp::SetAdd {
            element: "x".into(),
            tag: t1.clone(),
        })
        .unwrap();
        set.apply(&CrdtOp::SetRemove {
            element: "x".into(),
            tags: [t1].into_iter().collect(),
        })
        .unwrap();
        assert!(set.set_tags("x").is_none());
    }

    #[test]
    fn directory_put_and_remove_resolve_by_tag_order() {
        let mut dir = CrdtValue::new(CrdtKind::Directory);
        dir.apply(&CrdtOp::DirectoryPut {
            key: "k".into(),
            tag: tag("a", 2, 0),
            value: "v".into(),
        })
        .unwrap();

        // Older remove loses.
        dir.apply(&CrdtOp::DirectoryRemove {
            key: "k".into(),
            tag: tag("b", 1, 0),
        })
        .unwrap();
        assert_eq!(dir.directory_get("k"), Some(Some("v")));

        // Newer remove wins and tombstones the key.
        dir.apply(&CrdtOp::DirectoryRemove {
            key: "k".into(),
            tag: tag("b", 3, 0),
        })
        .unwrap();
        assert_eq!(dir.directory_get("k"), Some(None));
        assert_eq!(dir.directory_keys().unwrap().count(), 0);
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let mut counter = CrdtValue::new(CrdtKind::Counter);
        let err = counter
            .apply(&CrdtOp::SetAdd {
                element: "x".into(),
                tag: tag("a", 1, 0),
            })
            .unwrap_err();
        assert_eq!(err.op_kind, CrdtKind::Set);
        assert_eq!(err.value_kind, CrdtKind::Counter);
    }
}
