use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use super::signature::MethodSignature;
use super::type_desc::{TypeDesc, TypeHandle};

bitflags::bitflags! {
    /// Method attributes the vtable builder cares about.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MethodFlags: u32 {
        const VIRTUAL = 1 << 0;
        const ABSTRACT = 1 << 1;
        const STATIC = 1 << 2;
        /// Never reuses a parent slot, even when name and signature match.
        const NEW_SLOT = 1 << 3;
        /// Cannot be overridden.
        const FINAL = 1 << 4;
        const PUBLIC = 1 << 5;
        const PRIVATE = 1 << 6;
        /// Overrides with a narrower return type. Checked against every ancestor.
        const COVARIANT_RETURN = 1 << 7;
    }
}

pub type MethodHandle = Arc<MethodDesc>;

/// A method of a loaded type. Everything but the slot is fixed at creation. The slot is assigned
/// once, while the owner's vtable is built.
pub struct MethodDesc {
    name: Arc<str>,
    owner: Weak<TypeDesc>,
    owner_name: Arc<str>,
    in_interface: bool,
    flags: MethodFlags,
    signature: MethodSignature,
    slot: AtomicI32,
    /// For a method of a generic instantiation, the method of the definition it was made from.
    declaring: Option<MethodHandle>,
}

const NO_SLOT: i32 = -1;

impl MethodDesc {
    pub(crate) fn new(
        name: Arc<str>,
        owner: Weak<TypeDesc>,
        owner_name: Arc<str>,
        in_interface: bool,
        flags: MethodFlags,
        signature: MethodSignature,
        declaring: Option<MethodHandle>,
    ) -> Self {
        MethodDesc {
            name,
            owner,
            owner_name,
            in_interface,
            flags,
            signature,
            slot: AtomicI32::new(NO_SLOT),
            declaring,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Namespace.Type.Method`.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.owner_name, self.name)
    }

    pub fn owner(&self) -> Option<TypeHandle> {
        self.owner.upgrade()
    }

    /// The owner, which is alive whenever one of its methods is being laid out.
    pub(crate) fn owner_type(&self) -> TypeHandle {
        match self.owner.upgrade() {
            Some(owner) => owner,
            None => panic!("method {} outlived its type", self.full_name()),
        }
    }

    pub fn is_owned_by(&self, ty: &TypeDesc) -> bool {
        std::ptr::eq(self.owner.as_ptr(), ty)
    }

    pub fn is_interface_method(&self) -> bool {
        self.in_interface
    }

    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    pub fn is_virtual(&self) -> bool {
        self.flags.contains(MethodFlags::VIRTUAL)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(MethodFlags::ABSTRACT)
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    pub fn is_new_slot(&self) -> bool {
        self.flags.contains(MethodFlags::NEW_SLOT)
    }

    pub fn is_final(&self) -> bool {
        self.flags.contains(MethodFlags::FINAL)
    }

    pub fn is_public(&self) -> bool {
        self.flags.contains(MethodFlags::PUBLIC)
    }

    pub fn is_private(&self) -> bool {
        self.flags.contains(MethodFlags::PRIVATE)
    }

    pub fn has_covariant_return(&self) -> bool {
        self.flags.contains(MethodFlags::COVARIANT_RETURN)
    }

    /// An instance method that takes a vtable slot.
    pub fn needs_slot(&self) -> bool {
        self.is_virtual() && !self.is_static()
    }

    pub fn declaring_method(&self) -> Option<&MethodHandle> {
        self.declaring.as_ref()
    }

    /// The vtable slot, once assigned. Interface methods are numbered within their interface.
    pub fn slot(&self) -> Option<usize> {
        match self.slot.load(Ordering::Acquire) {
            NO_SLOT => None,
            s => Some(s as usize),
        }
    }

    /// Assign the slot. A slot is assigned exactly once; anything else is a loader bug.
    pub(crate) fn set_slot(&self, slot: usize) {
        let slot = i32::try_from(slot).unwrap_or_else(|_| panic!("slot {} out of range", slot));
        if let Err(old) =
            self.slot
                .compare_exchange(NO_SLOT, slot, Ordering::AcqRel, Ordering::Acquire)
        {
            assert_eq!(
                old,
                slot,
                "method {} already has slot {}, cannot move it to {}",
                self.full_name(),
                old,
                slot
            );
        }
    }
}

impl fmt::Debug for MethodDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.full_name(), self.signature)?;
        if let Some(slot) = self.slot() {
            write!(f, " @{}", slot)?;
        }
        Ok(())
    }
}
