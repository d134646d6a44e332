//! Lazily resolved pointers between nodes.
//!
//! A [`Pointer`] records an address found inside one node. Its pointee is not
//! built until first asked for, and the outcome (value, empty or error) is then
//! memoized, so resolving twice never re-runs the lookup.

use std::cell::{Cell, OnceCell};
use std::fmt;
use std::marker::PhantomData;

use super::{AddressType, NodeClass, NodeId, NodeTree};
use crate::error::{Error, Result};
use crate::resolved::Resolved;

/// A node type that can be built at an arbitrary address.
pub trait Pointee {
    /// Class of the nodes this type materializes.
    const CLASS: NodeClass;

    /// Builds a node at `address`, in the context coordinates of `parent`, as
    /// a child of `parent`.
    fn materialize(tree: &NodeTree, parent: NodeId, address: u64) -> Result<NodeId>;
}

/// Which node a pointee is built under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rooting {
    /// Under the tree root; the address is a root context address.
    Absolute,
    /// Under the nearest ancestor of the given class (the source node included).
    Ancestor(NodeClass),
    /// Under the segment of the enclosing image that contains the address,
    /// which is a VM address.
    Segment,
}

/// A materializer that replaces [`Pointee::materialize`].
pub type Materializer = fn(&NodeTree, NodeId, u64) -> Result<NodeId>;

/// How a pointer resolves.
#[derive(Debug, Clone, Copy)]
pub struct PointerOptions {
    /// Where the pointee is rooted
    pub rooting: Rooting,
    /// A null address resolves to empty instead of an error
    pub optional: bool,
    /// Builds the pointee instead of the target type
    pub target_override: Option<Materializer>,
}

impl Default for PointerOptions {
    fn default() -> Self {
        Self {
            rooting: Rooting::Absolute,
            optional: false,
            target_override: None,
        }
    }
}

impl PointerOptions {
    /// Options with the given rooting.
    pub fn rooted(rooting: Rooting) -> Self {
        Self {
            rooting,
            ..Self::default()
        }
    }

    /// Marks the pointer as optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// An address plus its lazily built pointee of type `T`.
pub struct Pointer<T: Pointee> {
    address: u64,
    source: NodeId,
    options: PointerOptions,
    pointee: OnceCell<Resolved<NodeId>>,
    resolutions: Cell<u32>,
    _target: PhantomData<fn() -> T>,
}

impl<T: Pointee> fmt::Debug for Pointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pointer")
            .field("address", &format_args!("{:#x}", self.address))
            .field("source", &self.source)
            .field("target", &T::CLASS)
            .field("resolved", &self.pointee.get().is_some())
            .finish()
    }
}

impl<T: Pointee> Pointer<T> {
    /// Creates a pointer found in `source`.
    ///
    /// Fails if `address` has bits outside the source's data model pointer
    /// mask. The pointee is not resolved.
    pub fn new(tree: &NodeTree, source: NodeId, address: u64, options: PointerOptions) -> Result<Self> {
        let model = tree.data_model(source);
        if !model.is_representable(address) {
            return Err(Error::PointerNotRepresentable {
                address,
                mask: model.pointer_mask(),
            });
        }
        Ok(Self {
            address,
            source,
            options,
            pointee: OnceCell::new(),
            resolutions: Cell::new(0),
            _target: PhantomData,
        })
    }

    /// Returns the raw address.
    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the node the address was found in.
    #[inline]
    pub fn source(&self) -> NodeId {
        self.source
    }

    /// Returns how many times resolution actually ran (0 or 1).
    pub fn resolution_count(&self) -> u32 {
        self.resolutions.get()
    }

    /// Returns the pointee, resolving it on first access.
    pub fn pointee(&self, tree: &NodeTree) -> Resolved<NodeId> {
        self.pointee
            .get_or_init(|| {
                self.resolutions.set(self.resolutions.get() + 1);
                let outcome = self.resolve(tree);
                if let Some(error) = outcome.error_ref() {
                    tracing::debug!(
                        "pointer {:#x} from {} to {} failed: {}",
                        self.address,
                        self.source,
                        T::CLASS,
                        error
                    );
                }
                outcome
            })
            .clone()
    }

    fn resolve(&self, tree: &NodeTree) -> Resolved<NodeId> {
        if self.address == 0 {
            return if self.options.optional {
                Resolved::Empty
            } else {
                Resolved::error(Error::NullPointer)
            };
        }

        let parent = match self.root(tree) {
            Resolved::Value(parent) => parent,
            Resolved::Empty => {
                return Resolved::error(Error::NoContainingNode {
                    address: self.address,
                })
            }
            Resolved::Error(error) => return Resolved::Error(error),
        };

        // An equal pointer resolved earlier may already have built the node.
        let existing = tree.children(parent).into_iter().find(|&child| {
            let node = tree.get(child);
            node.class() == T::CLASS
                && node.range().and_then(|r| r.start(AddressType::Context)) == Some(self.address)
        });
        if let Some(child) = existing {
            return Resolved::Value(child);
        }

        if let Err(error) = tree.memory_map(parent).check_mapping(0, self.address, 1) {
            return Resolved::error(error);
        }

        let materialize = self.options.target_override.unwrap_or(T::materialize);
        materialize(tree, parent, self.address).into()
    }

    fn root(&self, tree: &NodeTree) -> Resolved<NodeId> {
        match self.options.rooting {
            Rooting::Absolute => Resolved::Value(tree.root()),
            Rooting::Ancestor(class) => tree.ancestor_of_class(self.source, class, true),
            Rooting::Segment => tree
                .ancestor_of_class(self.source, NodeClass::MachImage, true)
                .and_then(|image| {
                    tree.child_node_occupying_vm_address(
                        image,
                        self.address,
                        Some(NodeClass::Segment),
                    )
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::DataModel;
    use crate::error::ErrorKind;
    use crate::macho::CStringNode;
    use crate::memory::MemoryMap;

    fn tree() -> NodeTree {
        let mut data = vec![0u8; 0x40];
        data[0x10..0x16].copy_from_slice(b"hello\0");
        NodeTree::new(MemoryMap::from_bytes(data).unwrap(), DataModel::ARM64)
    }

    #[test]
    fn test_pointee_is_memoized() {
        let tree = tree();
        let pointer: Pointer<CStringNode> =
            Pointer::new(&tree, tree.root(), 0x10, PointerOptions::default()).unwrap();
        assert_eq!(pointer.resolution_count(), 0);

        let first = pointer.pointee(&tree);
        let second = pointer.pointee(&tree);
        assert_eq!(first, second);
        assert_eq!(pointer.resolution_count(), 1);

        let node = tree.get(*first.value().unwrap());
        assert_eq!(node.as_cstring().unwrap().value(), "hello");
    }

    #[test]
    fn test_failed_resolution_is_memoized() {
        let tree = tree();
        let pointer: Pointer<CStringNode> =
            Pointer::new(&tree, tree.root(), 0x1000, PointerOptions::default()).unwrap();
        let first = pointer.pointee(&tree);
        let second = pointer.pointee(&tree);
        assert!(first.is_error());
        assert_eq!(first, second);
        assert_eq!(pointer.resolution_count(), 1);
        assert_eq!(first.error_ref().unwrap().kind(), ErrorKind::NotMapped);
    }

    #[test]
    fn test_null_pointer() {
        let tree = tree();
        let required: Pointer<CStringNode> =
            Pointer::new(&tree, tree.root(), 0, PointerOptions::default()).unwrap();
        assert!(matches!(
            required.pointee(&tree).error_ref().map(|e| e.as_ref()),
            Some(Error::NullPointer)
        ));

        let optional: Pointer<CStringNode> =
            Pointer::new(&tree, tree.root(), 0, PointerOptions::default().optional()).unwrap();
        assert!(optional.pointee(&tree).is_empty());
    }

    #[test]
    fn test_unrepresentable_address() {
        let tree = tree();
        let err = Pointer::<CStringNode>::new(
            &tree,
            tree.root(),
            0x8000_0001_0000_0010,
            PointerOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::PointerNotRepresentable { .. }));
    }

    #[test]
    fn test_equal_pointers_share_pointee() {
        let tree = tree();
        let a: Pointer<CStringNode> =
            Pointer::new(&tree, tree.root(), 0x10, PointerOptions::default()).unwrap();
        let b: Pointer<CStringNode> =
            Pointer::new(&tree, tree.root(), 0x10, PointerOptions::default()).unwrap();
        assert_eq!(a.pointee(&tree), b.pointee(&tree));
        assert_eq!(tree.children(tree.root()).len(), 1);
    }

    #[test]
    fn test_missing_ancestor() {
        let tree = tree();
        let pointer: Pointer<CStringNode> = Pointer::new(
            &tree,
            tree.root(),
            0x10,
            PointerOptions::rooted(Rooting::Ancestor(NodeClass::SharedCache)),
        )
        .unwrap();
        let outcome = pointer.pointee(&tree);
        assert_eq!(outcome.error_ref().unwrap().kind(), ErrorKind::NotFound);
    }
}
