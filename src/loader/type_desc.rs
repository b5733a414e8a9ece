use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use super::interface_offsets::InterfaceLayout;
use super::method_desc::{MethodDesc, MethodFlags, MethodHandle};
use super::type_def::TypeDef;
use super::vtable::DispatchTable;
use crate::error::TypeLoadError;
use crate::util::rust_util::atomic_box::OnceOptionBox;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u32 {
        const INTERFACE = 1 << 0;
        const ABSTRACT = 1 << 1;
        const SEALED = 1 << 2;
        /// Gets a synthetic covariant element-store method in its size estimate.
        const ARRAY = 1 << 3;
        const GENERIC_DEFINITION = 1 << 4;
    }
}

pub type TypeHandle = Arc<TypeDesc>;

/// Where a type is in its one-way trip to a published vtable.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadState {
    Unbuilt = 0,
    Building = 1,
    Built = 2,
    Failed = 3,
}

impl LoadState {
    fn from_u8(raw: u8) -> LoadState {
        match raw {
            0 => LoadState::Unbuilt,
            1 => LoadState::Building,
            2 => LoadState::Built,
            3 => LoadState::Failed,
            _ => panic!("corrupted load state {}", raw),
        }
    }
}

/// An explicit override, with the body resolved lazily by name.
#[derive(Clone, Debug)]
pub struct MethodImpl {
    pub declaration: MethodHandle,
    pub body: Arc<str>,
}

/// A generic instantiation: the definition and the type arguments.
#[derive(Clone, Debug)]
pub struct GenericInstance {
    pub definition: TypeHandle,
    pub args: Vec<TypeHandle>,
}

/// A loaded class or interface.
///
/// The declared shape is immutable. The interface layout and the vtable are computed later, under
/// the loader lock, and each is published exactly once; after that they are read without locking.
/// A failure is published the same way and sticks.
pub struct TypeDesc {
    namespace: Arc<str>,
    name: Arc<str>,
    flags: TypeFlags,
    parent: Option<TypeHandle>,
    interfaces: Vec<TypeHandle>,
    methods: Vec<MethodHandle>,
    method_impls: Vec<MethodImpl>,
    generic: Option<GenericInstance>,
    interface_id: Option<u32>,
    state: AtomicU8,
    failure: OnceOptionBox<TypeLoadError>,
    layout: OnceOptionBox<InterfaceLayout>,
    dispatch: OnceOptionBox<DispatchTable>,
}

impl TypeDesc {
    /// Create a type from its definition. `declaring` gives, for a generic instantiation, the
    /// definition's methods in the same order.
    pub(crate) fn create(
        def: TypeDef,
        interface_id: Option<u32>,
        generic: Option<GenericInstance>,
        declaring: Option<&[MethodHandle]>,
    ) -> TypeHandle {
        let is_interface = def.flags.contains(TypeFlags::INTERFACE);
        assert_eq!(
            is_interface,
            interface_id.is_some(),
            "{}: interfaces and only interfaces get an interface id",
            def.name
        );
        if let Some(declaring) = declaring {
            assert_eq!(declaring.len(), def.methods.len());
        }
        let full_name: Arc<str> = join_name(&def.namespace, &def.name).into();
        Arc::new_cyclic(|this| {
            let methods = def
                .methods
                .into_iter()
                .enumerate()
                .map(|(i, m)| {
                    let mut flags = m.flags;
                    if is_interface && !flags.contains(MethodFlags::STATIC) {
                        flags |= MethodFlags::VIRTUAL;
                    }
                    Arc::new(MethodDesc::new(
                        m.name.into(),
                        this.clone(),
                        full_name.clone(),
                        is_interface,
                        flags,
                        m.signature,
                        declaring.map(|d| d[i].clone()),
                    ))
                })
                .collect();
            TypeDesc {
                namespace: def.namespace.into(),
                name: def.name.into(),
                flags: def.flags,
                parent: def.parent,
                interfaces: def.interfaces,
                methods,
                method_impls: def
                    .method_impls
                    .into_iter()
                    .map(|mi| MethodImpl {
                        declaration: mi.declaration,
                        body: mi.body.into(),
                    })
                    .collect(),
                generic,
                interface_id,
                state: AtomicU8::new(LoadState::Unbuilt as u8),
                failure: OnceOptionBox::new(),
                layout: OnceOptionBox::new(),
                dispatch: OnceOptionBox::new(),
            }
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> String {
        join_name(&self.namespace, &self.name)
    }

    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    pub fn is_interface(&self) -> bool {
        self.flags.contains(TypeFlags::INTERFACE)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(TypeFlags::ABSTRACT)
    }

    pub fn is_array(&self) -> bool {
        self.flags.contains(TypeFlags::ARRAY)
    }

    pub fn is_generic_definition(&self) -> bool {
        self.flags.contains(TypeFlags::GENERIC_DEFINITION)
    }

    pub fn parent(&self) -> Option<&TypeHandle> {
        self.parent.as_ref()
    }

    /// Ancestors, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = &TypeHandle> {
        std::iter::successors(self.parent.as_ref(), |t| t.parent.as_ref())
    }

    pub fn is_subclass_of(&self, other: &TypeDesc) -> bool {
        self.ancestors().any(|a| std::ptr::eq(&**a, other))
    }

    /// The interfaces this type lists itself. For an interface, the interfaces it extends.
    pub fn declared_interfaces(&self) -> &[TypeHandle] {
        &self.interfaces
    }

    /// Whether `iface` is reachable through declared interfaces of this type (not its ancestors),
    /// or is this type itself.
    pub fn extends_interface(&self, iface: &TypeDesc) -> bool {
        std::ptr::eq(self, iface)
            || self
                .interfaces
                .iter()
                .any(|i| i.extends_interface(iface))
    }

    pub fn methods(&self) -> &[MethodHandle] {
        &self.methods
    }

    pub fn virtual_methods(&self) -> impl Iterator<Item = &MethodHandle> {
        self.methods.iter().filter(|m| m.needs_slot())
    }

    pub fn virtual_method_count(&self) -> usize {
        self.virtual_methods().count()
    }

    /// The first method with this name.
    pub fn find_method(&self, name: &str) -> Option<&MethodHandle> {
        self.methods.iter().find(|m| m.name() == name)
    }

    pub fn method_impls(&self) -> &[MethodImpl] {
        &self.method_impls
    }

    pub fn generic(&self) -> Option<&GenericInstance> {
        self.generic.as_ref()
    }

    pub fn interface_id(&self) -> Option<u32> {
        self.interface_id
    }

    pub fn load_state(&self) -> LoadState {
        LoadState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The failure that made this type unusable, if any.
    pub fn failure(&self) -> Option<&TypeLoadError> {
        self.failure.get()
    }

    pub fn interface_layout(&self) -> Option<&InterfaceLayout> {
        self.layout.get()
    }

    pub fn dispatch_table(&self) -> Option<&DispatchTable> {
        self.dispatch.get()
    }

    pub fn vtable_size(&self) -> Option<usize> {
        self.dispatch.get().map(|d| d.len())
    }

    /// Move from `Unbuilt` to `Building`. Returns false if the type is past `Unbuilt`.
    pub(crate) fn begin_building(&self) -> bool {
        self.state
            .compare_exchange(
                LoadState::Unbuilt as u8,
                LoadState::Building as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn publish_layout(&self, layout: InterfaceLayout) -> &InterfaceLayout {
        self.layout.publish_or_get(layout)
    }

    /// Publish the vtable. The table becomes visible before the state says `Built`.
    pub(crate) fn publish_dispatch(&self, table: DispatchTable) -> &DispatchTable {
        let published = self.dispatch.publish_or_get(table);
        self.state.store(LoadState::Built as u8, Ordering::Release);
        published
    }

    /// Record a permanent failure and return the one that sticks.
    pub(crate) fn fail(&self, error: TypeLoadError) -> TypeLoadError {
        let stored = self.failure.publish_or_get(error).clone();
        self.state.store(LoadState::Failed as u8, Ordering::Release);
        debug!("Type {} failed to load: {}", self.full_name(), stored);
        stored
    }
}

fn join_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", namespace, name)
    }
}

impl fmt::Debug for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDesc")
            .field("name", &self.full_name())
            .field("flags", &self.flags)
            .field("state", &self.load_state())
            .finish()
    }
}
