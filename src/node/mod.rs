//! The node tree.
//!
//! Every structure found in a byte source becomes a [`Node`] in a [`NodeTree`].
//! Nodes live in an arena and refer to each other by [`NodeId`]; a node's parent
//! link is an id, never an owning pointer, so the tree has no reference cycles.
//!
//! A node inherits its parent's [`MemoryMap`] and [`DataModel`] unless it
//! overrides them. Segments override the map so lookups below them are
//! addressed by VM address; images override the data model to fix their
//! architecture. A node may claim a byte range ([`NodeRange`]) in its own
//! context coordinates, in VM coordinates, or both.
//!
//! Non-fatal problems found while building a node are appended to that node's
//! warnings instead of aborting construction.

pub mod pointer;
pub mod ranking;

use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::data_model::DataModel;
use crate::dyld_info::{BindInfo, ExportTrie, RebaseInfo};
use crate::error::{Error, Result, Warning};
use crate::macho::{
    CStringNode, FatArch, FatBinary, LoadCommand, MachImage, Section, Segment, StringTable,
    SymbolTable,
};
use crate::memory::MemoryMap;
use crate::resolved::Resolved;
use crate::shared_cache::SharedCache;
use crate::ParseOptions;

pub use pointer::{Pointee, Pointer, PointerOptions, Rooting};
pub use ranking::{Candidate, Registry};

// =============================================================================
// Identifiers and Ranges
// =============================================================================

/// Index of a node in its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Returns the arena index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Coordinate system of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    /// Position within the node's memory map (file offset or process address)
    Context,
    /// Position as mapped for execution, slide applied
    Vm,
}

/// A contiguous address range.
///
/// A zero size is only used by containers whose extent is unknown; such an
/// extent contains every address at or after its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First address
    pub address: u64,
    /// Number of bytes
    pub size: u64,
}

impl Extent {
    /// Returns true if `address` falls within this extent.
    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        if self.size == 0 {
            return address >= self.address;
        }
        address >= self.address && address - self.address < self.size
    }

    /// Returns the exclusive end, or `None` if it overflows.
    #[inline]
    pub fn end(&self) -> Option<u64> {
        self.address.checked_add(self.size)
    }
}

/// The byte range a backed node claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeRange {
    /// Range in the parent's context coordinates
    pub context: Option<Extent>,
    /// Range in VM coordinates
    pub vm: Option<Extent>,
}

impl NodeRange {
    /// A range in context coordinates only.
    pub fn context(address: u64, size: u64) -> Self {
        Self {
            context: Some(Extent { address, size }),
            vm: None,
        }
    }

    /// A range in VM coordinates only.
    pub fn vm(address: u64, size: u64) -> Self {
        Self {
            context: None,
            vm: Some(Extent { address, size }),
        }
    }

    /// Adds a VM range.
    pub fn with_vm(mut self, address: u64, size: u64) -> Self {
        self.vm = Some(Extent { address, size });
        self
    }

    /// Returns the extent in the given coordinates.
    #[inline]
    pub fn extent(&self, address_type: AddressType) -> Option<Extent> {
        match address_type {
            AddressType::Context => self.context,
            AddressType::Vm => self.vm,
        }
    }

    /// Returns the start address in the given coordinates.
    #[inline]
    pub fn start(&self, address_type: AddressType) -> Option<u64> {
        self.extent(address_type).map(|e| e.address)
    }

    /// Returns the size, preferring the context extent.
    pub fn size(&self) -> u64 {
        self.context.or(self.vm).map(|e| e.size).unwrap_or(0)
    }

    /// Returns true if `address` falls within the range in the given coordinates.
    #[inline]
    pub fn contains(&self, address: u64, address_type: AddressType) -> bool {
        self.extent(address_type)
            .map(|e| e.contains(address))
            .unwrap_or(false)
    }
}

// =============================================================================
// Node Classes
// =============================================================================

/// The kind of a node without its payload. Used as a lookup filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeClass {
    /// The root byte source
    Source,
    /// A fat (universal) binary
    FatBinary,
    /// One architecture entry of a fat binary
    FatArch,
    /// A Mach-O image
    MachImage,
    /// A load command
    LoadCommand,
    /// A segment
    Segment,
    /// A section
    Section,
    /// A string table
    StringTable,
    /// A symbol table
    SymbolTable,
    /// A rebase opcode stream
    RebaseInfo,
    /// A bind opcode stream
    BindInfo,
    /// An export trie
    ExportTrie,
    /// A dyld shared cache
    SharedCache,
    /// A NUL-terminated string
    CString,
}

impl NodeClass {
    /// Returns a display name.
    pub fn name(self) -> &'static str {
        match self {
            NodeClass::Source => "source",
            NodeClass::FatBinary => "fat binary",
            NodeClass::FatArch => "fat arch",
            NodeClass::MachImage => "mach image",
            NodeClass::LoadCommand => "load command",
            NodeClass::Segment => "segment",
            NodeClass::Section => "section",
            NodeClass::StringTable => "string table",
            NodeClass::SymbolTable => "symbol table",
            NodeClass::RebaseInfo => "rebase info",
            NodeClass::BindInfo => "bind info",
            NodeClass::ExportTrie => "export trie",
            NodeClass::SharedCache => "shared cache",
            NodeClass::CString => "string",
        }
    }

    /// Returns true for top-level containers, which may claim a zero size.
    pub fn is_container(self) -> bool {
        matches!(
            self,
            NodeClass::FatBinary | NodeClass::MachImage | NodeClass::SharedCache
        )
    }
}

impl fmt::Display for NodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The payload of a node.
#[derive(Debug)]
pub enum NodeKind {
    /// The root byte source
    Source,
    /// A fat binary header
    FatBinary(FatBinary),
    /// A fat arch entry
    FatArch(FatArch),
    /// A Mach-O image
    MachImage(MachImage),
    /// A load command
    LoadCommand(LoadCommand),
    /// A segment
    Segment(Segment),
    /// A section
    Section(Section),
    /// A string table
    StringTable(StringTable),
    /// A symbol table
    SymbolTable(SymbolTable),
    /// A rebase opcode stream
    RebaseInfo(RebaseInfo),
    /// A bind opcode stream
    BindInfo(BindInfo),
    /// An export trie
    ExportTrie(ExportTrie),
    /// A dyld shared cache
    SharedCache(SharedCache),
    /// A NUL-terminated string
    CString(CStringNode),
}

impl NodeKind {
    /// Returns the class of this payload.
    pub fn class(&self) -> NodeClass {
        match self {
            NodeKind::Source => NodeClass::Source,
            NodeKind::FatBinary(_) => NodeClass::FatBinary,
            NodeKind::FatArch(_) => NodeClass::FatArch,
            NodeKind::MachImage(_) => NodeClass::MachImage,
            NodeKind::LoadCommand(_) => NodeClass::LoadCommand,
            NodeKind::Segment(_) => NodeClass::Segment,
            NodeKind::Section(_) => NodeClass::Section,
            NodeKind::StringTable(_) => NodeClass::StringTable,
            NodeKind::SymbolTable(_) => NodeClass::SymbolTable,
            NodeKind::RebaseInfo(_) => NodeClass::RebaseInfo,
            NodeKind::BindInfo(_) => NodeClass::BindInfo,
            NodeKind::ExportTrie(_) => NodeClass::ExportTrie,
            NodeKind::SharedCache(_) => NodeClass::SharedCache,
            NodeKind::CString(_) => NodeClass::CString,
        }
    }
}

// =============================================================================
// Node
// =============================================================================

/// One entry of the tree.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    parent: Option<NodeId>,
    kind: NodeKind,
    range: Option<NodeRange>,
    memory_map: Option<Arc<MemoryMap>>,
    data_model: Option<DataModel>,
    children: RefCell<Vec<NodeId>>,
    warnings: RefCell<Vec<Warning>>,
}

macro_rules! payload_accessor {
    ($($fn_name:ident => $variant:ident($ty:ty)),* $(,)?) => {
        $(
            #[doc = concat!("Returns the payload if this is a `", stringify!($variant), "` node.")]
            pub fn $fn_name(&self) -> Option<&$ty> {
                match &self.kind {
                    NodeKind::$variant(payload) => Some(payload),
                    _ => None,
                }
            }
        )*
    };
}

impl Node {
    /// Returns this node's id.
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the parent id, `None` for the root.
    #[inline]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Returns the payload.
    #[inline]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Returns the class.
    #[inline]
    pub fn class(&self) -> NodeClass {
        self.kind.class()
    }

    /// Returns the claimed range, if this node is backed.
    #[inline]
    pub fn range(&self) -> Option<&NodeRange> {
        self.range.as_ref()
    }

    /// Returns the child ids in insertion order.
    pub fn children(&self) -> Vec<NodeId> {
        self.children.borrow().clone()
    }

    /// Returns the warnings recorded so far.
    pub fn warnings(&self) -> Ref<'_, Vec<Warning>> {
        self.warnings.borrow()
    }

    /// Returns true if this node overrides its memory map.
    pub fn overrides_memory_map(&self) -> bool {
        self.memory_map.is_some()
    }

    payload_accessor! {
        as_fat_binary => FatBinary(FatBinary),
        as_fat_arch => FatArch(FatArch),
        as_mach_image => MachImage(MachImage),
        as_load_command => LoadCommand(LoadCommand),
        as_segment => Segment(Segment),
        as_section => Section(Section),
        as_string_table => StringTable(StringTable),
        as_symbol_table => SymbolTable(SymbolTable),
        as_rebase_info => RebaseInfo(RebaseInfo),
        as_bind_info => BindInfo(BindInfo),
        as_export_trie => ExportTrie(ExportTrie),
        as_shared_cache => SharedCache(SharedCache),
        as_cstring => CString(CStringNode),
    }
}

/// A node waiting to be inserted.
#[derive(Debug)]
pub struct NewNode {
    kind: NodeKind,
    range: Option<NodeRange>,
    memory_map: Option<Arc<MemoryMap>>,
    data_model: Option<DataModel>,
}

impl NewNode {
    /// Creates an unbacked node.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            range: None,
            memory_map: None,
            data_model: None,
        }
    }

    /// Claims a byte range.
    pub fn backed(mut self, range: NodeRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Overrides the memory map inherited from the parent.
    pub fn with_memory_map(mut self, map: Arc<MemoryMap>) -> Self {
        self.memory_map = Some(map);
        self
    }

    /// Overrides the data model inherited from the parent.
    pub fn with_data_model(mut self, model: DataModel) -> Self {
        self.data_model = Some(model);
        self
    }
}

// =============================================================================
// Node Tree
// =============================================================================

/// Arena owning every node built from one byte source.
///
/// The tree is single-threaded. Node ids are only meaningful within the tree
/// that created them; passing a foreign id panics.
pub struct NodeTree {
    nodes: RefCell<Vec<Rc<Node>>>,
    root_map: Arc<MemoryMap>,
    root_model: DataModel,
    options: ParseOptions,
}

impl fmt::Debug for NodeTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTree")
            .field("nodes", &self.nodes.borrow().len())
            .finish()
    }
}

impl NodeTree {
    /// Creates a tree whose root reads `map` under `model`.
    pub fn new(map: MemoryMap, model: DataModel) -> Self {
        Self::with_options(map, model, ParseOptions::default())
    }

    /// Creates a tree with explicit parse options.
    pub fn with_options(map: MemoryMap, model: DataModel, options: ParseOptions) -> Self {
        let root_map = Arc::new(map);
        let root = Node {
            id: NodeId(0),
            parent: None,
            kind: NodeKind::Source,
            range: None,
            memory_map: Some(Arc::clone(&root_map)),
            data_model: Some(model),
            children: RefCell::new(Vec::new()),
            warnings: RefCell::new(Vec::new()),
        };
        Self {
            nodes: RefCell::new(vec![Rc::new(root)]),
            root_map,
            root_model: model,
            options,
        }
    }

    /// Returns the parse options.
    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    /// Returns the root source node.
    #[inline]
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Returns the number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    /// Returns true if only the root exists.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Returns a node.
    pub fn get(&self, id: NodeId) -> Rc<Node> {
        Rc::clone(&self.nodes.borrow()[id.index()])
    }

    /// Inserts a node as the last child of `parent`.
    ///
    /// Fails without inserting if the range is unrepresentable or claims a
    /// zero size for a class that is not a container.
    pub fn insert(&self, parent: NodeId, node: NewNode) -> Result<NodeId> {
        let class = node.kind.class();
        if let Some(range) = &node.range {
            if range.context.is_none() && range.vm.is_none() {
                return Err(Error::parse(0, format!("{class} range has no coordinates")));
            }
            for extent in [range.context, range.vm].into_iter().flatten() {
                extent.end().ok_or(Error::AddressOverflow {
                    address: extent.address,
                    offset: extent.size,
                })?;
                if extent.size == 0 && !class.is_container() {
                    return Err(Error::ZeroSize { what: class.name() });
                }
            }
        }

        let parent_node = self.get(parent);
        let mut nodes = self.nodes.borrow_mut();
        let id = NodeId(nodes.len() as u32);
        nodes.push(Rc::new(Node {
            id,
            parent: Some(parent),
            kind: node.kind,
            range: node.range,
            memory_map: node.memory_map,
            data_model: node.data_model,
            children: RefCell::new(Vec::new()),
            warnings: RefCell::new(Vec::new()),
        }));
        drop(nodes);
        parent_node.children.borrow_mut().push(id);

        tracing::trace!("inserted {} {} under {}", class, id, parent);
        Ok(id)
    }

    /// Appends a warning to a node.
    pub fn warn(&self, id: NodeId, warning: Warning) {
        tracing::debug!("{} {}: {}", self.get(id).class(), id, warning);
        self.get(id).warnings.borrow_mut().push(warning);
    }

    /// Records an error as a warning on `id`.
    pub fn warn_error(&self, id: NodeId, property: &str, error: Error) {
        self.warn(id, Warning::from_error(property, error));
    }

    /// Returns the memory map in effect for a node.
    pub fn memory_map(&self, id: NodeId) -> Arc<MemoryMap> {
        let mut current = Some(id);
        while let Some(cur) = current {
            let node = self.get(cur);
            if let Some(map) = &node.memory_map {
                return Arc::clone(map);
            }
            current = node.parent;
        }
        Arc::clone(&self.root_map)
    }

    /// Returns the data model in effect for a node.
    pub fn data_model(&self, id: NodeId) -> DataModel {
        let mut current = Some(id);
        while let Some(cur) = current {
            let node = self.get(cur);
            if let Some(model) = node.data_model {
                return model;
            }
            current = node.parent;
        }
        self.root_model
    }

    /// Returns the children of `id` in insertion order.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.get(id).children()
    }

    /// Returns the children of `id` of one class.
    pub fn children_of_class(&self, id: NodeId, class: NodeClass) -> Vec<NodeId> {
        self.children(id)
            .into_iter()
            .filter(|&child| self.get(child).class() == class)
            .collect()
    }

    /// Returns the nearest ancestor of a class, regardless of address.
    pub fn ancestor_of_class(
        &self,
        id: NodeId,
        class: NodeClass,
        include_receiver: bool,
    ) -> Resolved<NodeId> {
        let mut current = if include_receiver {
            Some(id)
        } else {
            self.get(id).parent
        };
        while let Some(cur) = current {
            let node = self.get(cur);
            if node.class() == class {
                return Resolved::Value(cur);
            }
            current = node.parent;
        }
        Resolved::Empty
    }

    /// Walks parent links for the nearest node whose range contains `address`.
    ///
    /// A `target` of `None` matches any backed node. Walking off the root is an
    /// empty result, not an error.
    pub fn ancestor_node_occupying_address(
        &self,
        id: NodeId,
        address: u64,
        address_type: AddressType,
        target: Option<NodeClass>,
        include_receiver: bool,
    ) -> Resolved<NodeId> {
        let mut current = if include_receiver {
            Some(id)
        } else {
            self.get(id).parent
        };
        while let Some(cur) = current {
            let node = self.get(cur);
            let occupies = node
                .range
                .map(|r| r.contains(address, address_type))
                .unwrap_or(false);
            if occupies && target.map_or(true, |class| node.class() == class) {
                return Resolved::Value(cur);
            }
            current = node.parent;
        }
        Resolved::Empty
    }

    /// Finds the deepest descendant of `id` whose VM range contains `address`.
    pub fn child_node_occupying_vm_address(
        &self,
        id: NodeId,
        address: u64,
        target: Option<NodeClass>,
    ) -> Resolved<NodeId> {
        let candidates = self
            .children(id)
            .into_iter()
            .map(Resolved::Value)
            .collect();
        let sorted = self.sort_node_array(candidates, AddressType::Vm);
        let Some(child) = self.child_in_sorted(&sorted, address, AddressType::Vm) else {
            return Resolved::Empty;
        };

        let deeper = self.child_node_occupying_vm_address(child, address, target);
        if deeper.is_value() {
            return deeper;
        }
        if target.map_or(true, |class| self.get(child).class() == class) {
            Resolved::Value(child)
        } else {
            Resolved::Empty
        }
    }

    /// Finds a descendant of `id` whose VM range starts exactly at `address`.
    ///
    /// Prefers the deepest such node.
    pub fn child_node_at_vm_address(
        &self,
        id: NodeId,
        address: u64,
        target: Option<NodeClass>,
    ) -> Resolved<NodeId> {
        let found = self.child_node_occupying_vm_address(id, address, None);
        let Some(&deepest) = found.value() else {
            return found;
        };

        let mut current = Some(deepest);
        while let Some(cur) = current {
            if cur == id {
                break;
            }
            let node = self.get(cur);
            let starts_here = node.range.and_then(|r| r.start(AddressType::Vm)) == Some(address);
            if starts_here && target.map_or(true, |class| node.class() == class) {
                return Resolved::Value(cur);
            }
            current = node.parent;
        }
        Resolved::Empty
    }

    /// Sorts nodes by start address in the given coordinates.
    ///
    /// Empty and failed entries, and nodes without a range in those
    /// coordinates, are dropped.
    pub fn sort_node_array(
        &self,
        nodes: Vec<Resolved<NodeId>>,
        address_type: AddressType,
    ) -> Vec<NodeId> {
        let mut keyed: Vec<(u64, NodeId)> = nodes
            .into_iter()
            .filter_map(Resolved::into_value)
            .filter_map(|id| {
                self.get(id)
                    .range
                    .and_then(|r| r.start(address_type))
                    .map(|start| (start, id))
            })
            .collect();
        keyed.sort_by_key(|&(start, id)| (start, id));
        keyed.into_iter().map(|(_, id)| id).collect()
    }

    /// Finds the node containing `address` among nodes sorted by
    /// [`sort_node_array`](Self::sort_node_array).
    ///
    /// A binary search finds the last node starting at or before `address`;
    /// from there the nodes are scanned backwards until one contains it. The
    /// first probe decides it when ranges are disjoint, but overlapping ranges
    /// can make a miss linear in the number of earlier nodes. When ranges
    /// overlap, the last node starting at or before `address` that contains it
    /// wins.
    pub fn child_in_sorted(
        &self,
        sorted: &[NodeId],
        address: u64,
        address_type: AddressType,
    ) -> Option<NodeId> {
        let start_of = |id: NodeId| {
            self.get(id)
                .range
                .and_then(|r| r.start(address_type))
                .unwrap_or(u64::MAX)
        };
        let upper = sorted.partition_point(|&id| start_of(id) <= address);
        sorted[..upper].iter().rev().copied().find(|&id| {
            self.get(id)
                .range
                .map(|r| r.contains(address, address_type))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::macho::CStringNode;

    fn string_node(value: &str) -> NodeKind {
        NodeKind::CString(CStringNode::new(value.to_string()))
    }

    fn tree() -> NodeTree {
        NodeTree::new(MemoryMap::from_bytes(vec![0; 0x100]).unwrap(), DataModel::LP64)
    }

    #[test]
    fn test_inherits_map_and_model() {
        let tree = tree();
        let a = tree
            .insert(
                tree.root(),
                NewNode::new(string_node("a")).backed(NodeRange::context(0x10, 4)),
            )
            .unwrap();
        let b = tree
            .insert(
                a,
                NewNode::new(string_node("b"))
                    .backed(NodeRange::context(0x10, 2))
                    .with_data_model(DataModel::PPC),
            )
            .unwrap();
        let c = tree
            .insert(b, NewNode::new(string_node("c")).backed(NodeRange::context(0x11, 1)))
            .unwrap();

        assert_eq!(tree.data_model(a), DataModel::LP64);
        assert_eq!(tree.data_model(c), DataModel::PPC);
        assert!(Arc::ptr_eq(&tree.memory_map(c), &tree.memory_map(tree.root())));
        assert_eq!(tree.children(a), vec![b]);
        assert_eq!(tree.get(c).parent(), Some(b));
    }

    #[test]
    fn test_zero_size_only_for_containers() {
        let tree = tree();
        let err = tree
            .insert(
                tree.root(),
                NewNode::new(string_node("x")).backed(NodeRange::context(0, 0)),
            )
            .unwrap_err();
        assert!(matches!(err, Error::ZeroSize { .. }));

        let err = tree
            .insert(
                tree.root(),
                NewNode::new(string_node("x")).backed(NodeRange::context(u64::MAX, 2)),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overflow);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_ancestor_lookup() {
        let tree = tree();
        let outer = tree
            .insert(
                tree.root(),
                NewNode::new(string_node("outer")).backed(NodeRange::context(0, 0x80)),
            )
            .unwrap();
        let inner = tree
            .insert(
                outer,
                NewNode::new(string_node("inner")).backed(NodeRange::context(0x40, 0x10)),
            )
            .unwrap();

        let found =
            tree.ancestor_node_occupying_address(inner, 0x44, AddressType::Context, None, true);
        assert_eq!(found, Resolved::Value(inner));

        let found =
            tree.ancestor_node_occupying_address(inner, 0x44, AddressType::Context, None, false);
        assert_eq!(found, Resolved::Value(outer));

        let found = tree.ancestor_node_occupying_address(
            inner,
            0x44,
            AddressType::Context,
            Some(NodeClass::Segment),
            true,
        );
        assert!(found.is_empty());

        // No VM ranges anywhere: walking off the root is empty, not an error.
        let found = tree.ancestor_node_occupying_address(inner, 0x44, AddressType::Vm, None, true);
        assert!(found.is_empty());
    }

    #[test]
    fn test_sorted_child_search_with_overlap() {
        let tree = tree();
        let ids: Vec<NodeId> = [(0x10u64, 0x40u64), (0x18, 0x4), (0x30, 0x4)]
            .iter()
            .map(|&(vm, size)| {
                tree.insert(
                    tree.root(),
                    NewNode::new(string_node("s")).backed(NodeRange::vm(vm, size)),
                )
                .unwrap()
            })
            .collect();
        let input = ids.iter().copied().map(Resolved::Value).collect();
        let sorted = tree.sort_node_array(input, AddressType::Vm);

        assert_eq!(tree.child_in_sorted(&sorted, 0x19, AddressType::Vm), Some(ids[1]));
        assert_eq!(tree.child_in_sorted(&sorted, 0x31, AddressType::Vm), Some(ids[2]));
        // Past the later nodes, the scan falls back to the wide one.
        assert_eq!(tree.child_in_sorted(&sorted, 0x40, AddressType::Vm), Some(ids[0]));
        assert_eq!(tree.child_in_sorted(&sorted, 0x50, AddressType::Vm), None);
    }

    #[test]
    fn test_sorted_child_search() {
        let tree = tree();
        let ids: Vec<NodeId> = [(0x30u64, 0x10u64), (0x10, 0x10), (0x20, 0x8)]
            .iter()
            .map(|&(vm, size)| {
                tree.insert(
                    tree.root(),
                    NewNode::new(string_node("s")).backed(NodeRange::vm(vm, size)),
                )
                .unwrap()
            })
            .collect();

        let mut input: Vec<Resolved<NodeId>> = ids.iter().copied().map(Resolved::Value).collect();
        input.push(Resolved::Empty);
        input.push(Resolved::error(Error::NullPointer));

        let sorted = tree.sort_node_array(input, AddressType::Vm);
        assert_eq!(sorted, vec![ids[1], ids[2], ids[0]]);

        assert_eq!(tree.child_in_sorted(&sorted, 0x15, AddressType::Vm), Some(ids[1]));
        assert_eq!(tree.child_in_sorted(&sorted, 0x27, AddressType::Vm), Some(ids[2]));
        assert_eq!(tree.child_in_sorted(&sorted, 0x29, AddressType::Vm), None);
        assert_eq!(tree.child_in_sorted(&sorted, 0x3F, AddressType::Vm), Some(ids[0]));
        assert_eq!(tree.child_in_sorted(&sorted, 0x40, AddressType::Vm), None);

        assert_eq!(
            tree.child_node_occupying_vm_address(tree.root(), 0x22, None),
            Resolved::Value(ids[2])
        );
        assert_eq!(
            tree.child_node_at_vm_address(tree.root(), 0x20, None),
            Resolved::Value(ids[2])
        );
        assert!(tree.child_node_at_vm_address(tree.root(), 0x22, None).is_empty());
    }

    #[test]
    fn test_warnings_accumulate() {
        let tree = tree();
        tree.warn_error(tree.root(), "magic", Error::InvalidMachoMagic(0));
        tree.warn_error(tree.root(), "ncmds", Error::NullPointer);
        let root = tree.get(tree.root());
        let warnings = root.warnings();
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].property, "magic");
        assert_eq!(warnings[1].code, ErrorKind::NotFound);
    }
}
