//! Builders describing a type before it is loaded.

use super::method_desc::{MethodFlags, MethodHandle};
use super::signature::MethodSignature;
use super::type_desc::{TypeFlags, TypeHandle};

/// A method as declared.
#[derive(Clone, Debug)]
pub struct MethodDef {
    pub(crate) name: String,
    pub(crate) flags: MethodFlags,
    pub(crate) signature: MethodSignature,
}

impl MethodDef {
    pub fn new(name: &str, flags: MethodFlags, signature: MethodSignature) -> Self {
        MethodDef {
            name: name.to_string(),
            flags,
            signature,
        }
    }

    /// A public virtual `void ()` method.
    pub fn virtual_method(name: &str) -> Self {
        Self::new(
            name,
            MethodFlags::VIRTUAL | MethodFlags::PUBLIC,
            MethodSignature::void(),
        )
    }

    /// A public abstract `void ()` method.
    pub fn abstract_method(name: &str) -> Self {
        Self::new(
            name,
            MethodFlags::VIRTUAL | MethodFlags::ABSTRACT | MethodFlags::PUBLIC,
            MethodSignature::void(),
        )
    }

    /// A public non-virtual `void ()` method.
    pub fn instance_method(name: &str) -> Self {
        Self::new(name, MethodFlags::PUBLIC, MethodSignature::void())
    }

    pub fn with_flags(mut self, flags: MethodFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn without_flags(mut self, flags: MethodFlags) -> Self {
        self.flags -= flags;
        self
    }

    pub fn with_signature(mut self, signature: MethodSignature) -> Self {
        self.signature = signature;
        self
    }
}

/// An explicit override: `body` (a method of the type being defined, by name) implements
/// `declaration` (a method of an ancestor or of an implemented interface).
#[derive(Clone, Debug)]
pub struct MethodImplDef {
    pub(crate) declaration: MethodHandle,
    pub(crate) body: String,
}

/// A type as declared, ready for `Runtime::define_type`.
#[derive(Clone, Debug)]
pub struct TypeDef {
    pub(crate) namespace: String,
    pub(crate) name: String,
    pub(crate) flags: TypeFlags,
    pub(crate) parent: Option<TypeHandle>,
    pub(crate) interfaces: Vec<TypeHandle>,
    pub(crate) methods: Vec<MethodDef>,
    pub(crate) method_impls: Vec<MethodImplDef>,
}

impl TypeDef {
    pub fn class(namespace: &str, name: &str) -> Self {
        TypeDef {
            namespace: namespace.to_string(),
            name: name.to_string(),
            flags: TypeFlags::empty(),
            parent: None,
            interfaces: vec![],
            methods: vec![],
            method_impls: vec![],
        }
    }

    pub fn interface(namespace: &str, name: &str) -> Self {
        Self::class(namespace, name).with_flags(TypeFlags::INTERFACE | TypeFlags::ABSTRACT)
    }

    pub fn with_flags(mut self, flags: TypeFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn extends(mut self, parent: &TypeHandle) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn implements(mut self, interface: &TypeHandle) -> Self {
        self.interfaces.push(interface.clone());
        self
    }

    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Implement `declaration` with this type's method named `body`.
    pub fn with_override(mut self, declaration: &MethodHandle, body: &str) -> Self {
        self.method_impls.push(MethodImplDef {
            declaration: declaration.clone(),
            body: body.to_string(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}
