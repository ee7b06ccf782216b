//! Nested argument and result structures and their flat leaf views.
//!
//! Flattening walks a [`Tree`] depth-first, left to right (dictionaries in key order) and
//! returns the leaves together with a [`TreeSpec`] that rebuilds the same shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("structure expects {expected} leaves, got {found}")]
    LeafCount { expected: usize, found: usize },
    #[error("call arguments must flatten from a `(args, kwargs)` pair")]
    NotCallArgs,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tree<V> {
    Leaf(V),
    Tuple(Vec<Tree<V>>),
    List(Vec<Tree<V>>),
    Dict(BTreeMap<String, Tree<V>>),
}

impl<V> Tree<V> {
    pub fn leaf(value: V) -> Self {
        Tree::Leaf(value)
    }

    pub fn tuple(items: impl IntoIterator<Item = Tree<V>>) -> Self {
        Tree::Tuple(items.into_iter().collect())
    }

    pub fn list(items: impl IntoIterator<Item = Tree<V>>) -> Self {
        Tree::List(items.into_iter().collect())
    }

    pub fn num_leaves(&self) -> usize {
        match self {
            Tree::Leaf(_) => 1,
            Tree::Tuple(items) | Tree::List(items) => items.iter().map(Tree::num_leaves).sum(),
            Tree::Dict(entries) => entries.values().map(Tree::num_leaves).sum(),
        }
    }

    pub fn as_leaf(&self) -> Option<&V> {
        match self {
            Tree::Leaf(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_leaf(self) -> Option<V> {
        match self {
            Tree::Leaf(value) => Some(value),
            _ => None,
        }
    }

    pub fn flatten(self) -> (Vec<V>, TreeSpec) {
        let mut leaves = Vec::with_capacity(self.num_leaves());
        let spec = self.flatten_into(&mut leaves);
        (leaves, spec)
    }

    fn flatten_into(self, leaves: &mut Vec<V>) -> TreeSpec {
        match self {
            Tree::Leaf(value) => {
                leaves.push(value);
                TreeSpec::Leaf
            }
            Tree::Tuple(items) => TreeSpec::Tuple(
                items
                    .into_iter()
                    .map(|item| item.flatten_into(leaves))
                    .collect(),
            ),
            Tree::List(items) => TreeSpec::List(
                items
                    .into_iter()
                    .map(|item| item.flatten_into(leaves))
                    .collect(),
            ),
            Tree::Dict(entries) => TreeSpec::Dict(
                entries
                    .into_iter()
                    .map(|(key, item)| (key, item.flatten_into(leaves)))
                    .collect(),
            ),
        }
    }

    pub fn map<U>(self, f: &mut impl FnMut(V) -> U) -> Tree<U> {
        match self {
            Tree::Leaf(value) => Tree::Leaf(f(value)),
            Tree::Tuple(items) => {
                Tree::Tuple(items.into_iter().map(|item| item.map(&mut *f)).collect())
            }
            Tree::List(items) => {
                Tree::List(items.into_iter().map(|item| item.map(&mut *f)).collect())
            }
            Tree::Dict(entries) => Tree::Dict(
                entries
                    .into_iter()
                    .map(|(key, item)| (key, item.map(&mut *f)))
                    .collect(),
            ),
        }
    }
}

impl<V> From<V> for Tree<V> {
    fn from(value: V) -> Self {
        Tree::Leaf(value)
    }
}

/// Shape of a flattened [`Tree`], without its leaves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeSpec {
    Leaf,
    Tuple(Vec<TreeSpec>),
    List(Vec<TreeSpec>),
    Dict(Vec<(String, TreeSpec)>),
}

impl TreeSpec {
    pub fn num_leaves(&self) -> usize {
        match self {
            TreeSpec::Leaf => 1,
            TreeSpec::Tuple(items) | TreeSpec::List(items) => {
                items.iter().map(TreeSpec::num_leaves).sum()
            }
            TreeSpec::Dict(entries) => entries.iter().map(|(_, item)| item.num_leaves()).sum(),
        }
    }

    pub fn unflatten<V>(&self, leaves: Vec<V>) -> Result<Tree<V>, TreeError> {
        let expected = self.num_leaves();
        if leaves.len() != expected {
            return Err(TreeError::LeafCount {
                expected,
                found: leaves.len(),
            });
        }
        let mut iter = leaves.into_iter();
        Ok(self.rebuild(&mut iter))
    }

    fn rebuild<V>(&self, leaves: &mut std::vec::IntoIter<V>) -> Tree<V> {
        match self {
            TreeSpec::Leaf => match leaves.next() {
                Some(value) => Tree::Leaf(value),
                None => unreachable!("leaf count checked before rebuilding"),
            },
            TreeSpec::Tuple(items) => {
                Tree::Tuple(items.iter().map(|item| item.rebuild(leaves)).collect())
            }
            TreeSpec::List(items) => {
                Tree::List(items.iter().map(|item| item.rebuild(leaves)).collect())
            }
            TreeSpec::Dict(entries) => Tree::Dict(
                entries
                    .iter()
                    .map(|(key, item)| (key.clone(), item.rebuild(leaves)))
                    .collect(),
            ),
        }
    }
}

/// How flat results turn back into the structure a function returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSpec {
    /// A single value.
    Leaf,
    /// A tuple or list whose every element is a leaf.
    Flat { len: usize, list: bool },
    /// Anything else; rebuilt through the full spec.
    Nested(TreeSpec),
}

impl OutputSpec {
    pub fn classify(spec: &TreeSpec) -> Self {
        match spec {
            TreeSpec::Leaf => OutputSpec::Leaf,
            TreeSpec::Tuple(items) if items.iter().all(|item| *item == TreeSpec::Leaf) => {
                OutputSpec::Flat {
                    len: items.len(),
                    list: false,
                }
            }
            TreeSpec::List(items) if items.iter().all(|item| *item == TreeSpec::Leaf) => {
                OutputSpec::Flat {
                    len: items.len(),
                    list: true,
                }
            }
            other => OutputSpec::Nested(other.clone()),
        }
    }

    pub fn num_leaves(&self) -> usize {
        match self {
            OutputSpec::Leaf => 1,
            OutputSpec::Flat { len, .. } => *len,
            OutputSpec::Nested(spec) => spec.num_leaves(),
        }
    }

    pub fn reconstruct<V>(&self, mut leaves: Vec<V>) -> Result<Tree<V>, TreeError> {
        let expected = self.num_leaves();
        if leaves.len() != expected {
            return Err(TreeError::LeafCount {
                expected,
                found: leaves.len(),
            });
        }
        Ok(match self {
            OutputSpec::Leaf => Tree::Leaf(leaves.remove(0)),
            OutputSpec::Flat { list: false, .. } => {
                Tree::Tuple(leaves.into_iter().map(Tree::Leaf).collect())
            }
            OutputSpec::Flat { list: true, .. } => {
                Tree::List(leaves.into_iter().map(Tree::Leaf).collect())
            }
            OutputSpec::Nested(spec) => return spec.unflatten(leaves),
        })
    }
}

/// Positional and keyword arguments of one call. Keywords are kept sorted by name.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArgs<V> {
    pub args: Vec<Tree<V>>,
    pub kwargs: BTreeMap<String, Tree<V>>,
}

impl<V> Default for CallArgs<V> {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }
}

impl<V> CallArgs<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(args: impl IntoIterator<Item = V>) -> Self {
        Self {
            args: args.into_iter().map(Tree::Leaf).collect(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Tree<V>>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Tree<V>>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Positional argument `index` when it is a single leaf.
    pub fn leaf(&self, index: usize) -> Option<&V> {
        self.args.get(index).and_then(Tree::as_leaf)
    }

    pub fn kwarg_leaf(&self, name: &str) -> Option<&V> {
        self.kwargs.get(name).and_then(Tree::as_leaf)
    }

    /// Flattens as the pair `(args, kwargs)`.
    pub fn flatten(self) -> (Vec<V>, TreeSpec) {
        Tree::Tuple(vec![Tree::Tuple(self.args), Tree::Dict(self.kwargs)]).flatten()
    }

    /// Inverse of [`CallArgs::flatten`].
    pub fn unflatten(spec: &TreeSpec, leaves: Vec<V>) -> Result<Self, TreeError> {
        match spec.unflatten(leaves)? {
            Tree::Tuple(mut parts) if parts.len() == 2 => {
                let kwargs = parts.pop();
                let args = parts.pop();
                match (args, kwargs) {
                    (Some(Tree::Tuple(args)), Some(Tree::Dict(kwargs))) => {
                        Ok(CallArgs { args, kwargs })
                    }
                    _ => Err(TreeError::NotCallArgs),
                }
            }
            _ => Err(TreeError::NotCallArgs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_visits_dicts_in_key_order() {
        let call = CallArgs::<i32>::new()
            .arg(1)
            .arg(Tree::list([Tree::leaf(2), Tree::leaf(3)]))
            .kwarg("z", 5)
            .kwarg("a", 4);
        let (leaves, spec) = call.clone().flatten();
        assert_eq!(leaves, vec![1, 2, 3, 4, 5]);
        assert_eq!(spec.num_leaves(), 5);
        assert_eq!(CallArgs::unflatten(&spec, leaves).expect("rebuild"), call);
    }

    #[test]
    fn output_spec_classification() {
        let (_, leaf) = Tree::leaf(1).flatten();
        assert_eq!(OutputSpec::classify(&leaf), OutputSpec::Leaf);

        let (_, flat) = Tree::tuple([Tree::leaf(1), Tree::leaf(2)]).flatten();
        assert_eq!(
            OutputSpec::classify(&flat),
            OutputSpec::Flat {
                len: 2,
                list: false
            }
        );

        let nested = Tree::tuple([Tree::leaf(1), Tree::list([Tree::leaf(2)])]);
        let (leaves, spec) = nested.clone().flatten();
        let output = OutputSpec::classify(&spec);
        assert!(matches!(output, OutputSpec::Nested(_)));
        assert_eq!(output.reconstruct(leaves).expect("rebuild"), nested);
    }

    #[test]
    fn wrong_leaf_count_is_rejected() {
        let spec = TreeSpec::Tuple(vec![TreeSpec::Leaf, TreeSpec::Leaf]);
        assert_eq!(
            spec.unflatten(vec![1]),
            Err(TreeError::LeafCount {
                expected: 2,
                found: 1
            })
        );
        assert!(OutputSpec::Leaf.reconstruct(Vec::<u8>::new()).is_err());
    }
}
