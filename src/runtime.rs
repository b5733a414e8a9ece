use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::ReentrantMutex;

use crate::error::{DispatchError, TypeLoadError};
use crate::loader::dispatch;
use crate::loader::{
    DispatchTable, GenericInstance, InterfaceLayout, Loader, MethodDef, MethodHandle,
    MethodImplDef, MethodSignature, Module, SigType, TypeDef, TypeDesc, TypeFlags, TypeHandle,
};
use crate::stw::{MutatorHandle, PauseStats, StopTheWorld};
use crate::util::options::Options;
use crate::util::ConcurrentMap;
use crate::vm::{TypeSystem, VMBinding};

/// Configures and creates a [`Runtime`].
///
/// Options start from their defaults with `RTCORE_*` environment variables applied, and can be
/// changed with [`RuntimeBuilder::set_option`] before `build`.
pub struct RuntimeBuilder {
    options: Options,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        RuntimeBuilder {
            options: Options::default(),
        }
    }

    /// Start from the built-in defaults, ignoring the environment.
    pub fn defaults_only() -> Self {
        RuntimeBuilder {
            options: Options::defaults_only(),
        }
    }

    /// Set an option by name. Returns false, and keeps the old value, if the name is unknown or
    /// the value is invalid.
    pub fn set_option(&mut self, name: &str, value: &str) -> bool {
        self.options.set_from_str(name, value)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn build<VM: VMBinding>(
        &self,
        type_system: VM::VMTypeSystem,
        suspend: VM::VMSuspend,
    ) -> Runtime<VM> {
        match crate::util::logger::try_init() {
            Ok(_) => debug!("rtcore initialized the logger."),
            Err(_) => debug!(
                "rtcore failed to initialize the logger. Possibly a logger has been initialized by user."
            ),
        }
        let options = self.options.clone();
        let capacity = options.map_initial_capacity;
        Runtime {
            stw: StopTheWorld::new(suspend, &options),
            type_system,
            loader_lock: ReentrantMutex::new(()),
            next_iid: AtomicU32::new(0),
            types: ConcurrentMap::with_capacity(capacity),
            instantiations: ConcurrentMap::with_capacity(capacity),
            options,
        }
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Interning key of a generic instantiation: the definition and the arguments, by identity.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct InstantiationKey {
    definition: usize,
    args: Vec<usize>,
}

impl InstantiationKey {
    fn new(definition: &TypeHandle, args: &[TypeHandle]) -> Self {
        InstantiationKey {
            definition: Arc::as_ptr(definition) as usize,
            args: args.iter().map(|a| Arc::as_ptr(a) as usize).collect(),
        }
    }
}

/// One runtime instance: its types, its loader lock, its threads and its stop-the-world
/// coordinator. Instances are independent of each other.
pub struct Runtime<VM: VMBinding> {
    options: Options,
    type_system: VM::VMTypeSystem,
    /// Serializes type layout. Re-entrant, since building a vtable builds its prerequisites.
    loader_lock: ReentrantMutex<()>,
    next_iid: AtomicU32,
    types: ConcurrentMap<(String, String), TypeHandle>,
    instantiations: ConcurrentMap<InstantiationKey, TypeHandle>,
    stw: StopTheWorld<VM::VMSuspend>,
}

impl<VM: VMBinding> Runtime<VM> {
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn type_system(&self) -> &VM::VMTypeSystem {
        &self.type_system
    }

    fn allocate_iid(&self, flags: TypeFlags) -> Option<u32> {
        flags
            .contains(TypeFlags::INTERFACE)
            .then(|| self.next_iid.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a type and register it under its namespace and name. Interfaces get the next
    /// interface id. Layout happens later, on demand.
    pub fn define_type(&self, def: TypeDef) -> TypeHandle {
        let iid = self.allocate_iid(def.flags);
        let key = (def.namespace.clone(), def.name.clone());
        let ty = TypeDesc::create(def, iid, None, None);
        if let Some(old) = self.types.insert(key, ty.clone()) {
            warn!(
                "Type {} is defined again; name lookups now find the new definition",
                old.full_name()
            );
        }
        debug!("Defined {:?}", ty);
        ty
    }

    /// A type defined with `define_type`. Does not lock.
    pub fn find_type(&self, namespace: &str, name: &str) -> Option<TypeHandle> {
        self.types
            .lookup(&(namespace.to_string(), name.to_string()))
    }

    fn inflate_sig_type(&self, t: &SigType, args: &[TypeHandle]) -> SigType {
        match t {
            SigType::Type(ty) => SigType::Type(self.type_system.inflate(ty, args)),
            other => other.clone(),
        }
    }

    fn inflate_signature(&self, sig: &MethodSignature, args: &[TypeHandle]) -> MethodSignature {
        MethodSignature::new(
            sig.params
                .iter()
                .map(|p| self.inflate_sig_type(p, args))
                .collect(),
            self.inflate_sig_type(&sig.ret, args),
        )
    }

    /// The method of `inflated` at the position `method` has in its own type.
    fn inflate_method(&self, method: &MethodHandle, args: &[TypeHandle]) -> MethodHandle {
        let owner = method.owner_type();
        let inflated = self.type_system.inflate(&owner, args);
        if Arc::ptr_eq(&owner, &inflated) {
            return method.clone();
        }
        let index = owner
            .methods()
            .iter()
            .position(|m| Arc::ptr_eq(m, method))
            .unwrap_or_else(|| panic!("{} is not a method of its owner", method.full_name()));
        inflated.methods().get(index).cloned().unwrap_or_else(|| {
            panic!(
                "{} has no method at position {} to stand for {}",
                inflated.full_name(),
                index,
                method.full_name()
            )
        })
    }

    /// The instantiation of generic `definition` with `args`. The same definition and arguments
    /// always give the same handle.
    pub fn instantiate(&self, definition: &TypeHandle, args: &[TypeHandle]) -> TypeHandle {
        assert!(
            definition.is_generic_definition(),
            "{} is not a generic definition",
            definition.full_name()
        );
        let key = InstantiationKey::new(definition, args);
        if let Some(ty) = self.instantiations.lookup(&key) {
            return ty;
        }
        let _lock = self.loader_lock.lock();
        if let Some(ty) = self.instantiations.lookup(&key) {
            return ty;
        }

        let arg_names: Vec<String> = args.iter().map(|a| a.full_name()).collect();
        let def = TypeDef {
            namespace: definition.namespace().to_string(),
            name: format!("{}<{}>", definition.name(), arg_names.join(",")),
            flags: definition.flags() - TypeFlags::GENERIC_DEFINITION,
            parent: definition
                .parent()
                .map(|p| self.type_system.inflate(p, args)),
            interfaces: definition
                .declared_interfaces()
                .iter()
                .map(|i| self.type_system.inflate(i, args))
                .collect(),
            methods: definition
                .methods()
                .iter()
                .map(|m| {
                    MethodDef::new(m.name(), m.flags(), self.inflate_signature(m.signature(), args))
                })
                .collect(),
            method_impls: definition
                .method_impls()
                .iter()
                .map(|mi| MethodImplDef {
                    declaration: self.inflate_method(&mi.declaration, args),
                    body: mi.body.to_string(),
                })
                .collect(),
        };
        let iid = self.allocate_iid(def.flags);
        let ty = TypeDesc::create(
            def,
            iid,
            Some(GenericInstance {
                definition: definition.clone(),
                args: args.to_vec(),
            }),
            Some(definition.methods()),
        );
        debug!("Instantiated {:?}", ty);
        self.instantiations.insert(key, ty.clone());
        ty
    }

    pub fn new_module(&self, name: &str) -> Module {
        Module::new(name, self.options.name_index_buckets)
    }

    fn with_loader<R>(&self, f: impl FnOnce(&mut Loader<'_, VM::VMTypeSystem>) -> R) -> R {
        let _lock = self.loader_lock.lock();
        f(&mut Loader::new(&self.type_system, &self.options))
    }

    /// The interface layout of `ty`, resolving it (and building the parent's vtable) if needed.
    pub fn resolve_interface_offsets<'t>(
        &self,
        ty: &'t TypeHandle,
    ) -> Result<&'t InterfaceLayout, TypeLoadError> {
        if let Some(layout) = ty.interface_layout() {
            return Ok(layout);
        }
        self.with_loader(|loader| loader.resolve_interface_offsets(ty, None))
    }

    /// The vtable of `ty`, building it and everything it depends on if needed. A failure is
    /// permanent: the same error is returned on every later call.
    pub fn build_vtable<'t>(&self, ty: &'t TypeHandle) -> Result<&'t DispatchTable, TypeLoadError> {
        if let Some(table) = ty.dispatch_table() {
            return Ok(table);
        }
        if let Some(e) = ty.failure() {
            return Err(e.clone());
        }
        self.with_loader(|loader| loader.build_vtable(ty))
    }

    pub fn dispatch_virtual(
        &self,
        ty: &TypeHandle,
        method: &MethodHandle,
    ) -> Result<MethodHandle, DispatchError> {
        self.build_vtable(ty)?;
        dispatch::dispatch_virtual(ty, method)
    }

    pub fn dispatch_interface(
        &self,
        ty: &TypeHandle,
        declaration: &MethodHandle,
    ) -> Result<MethodHandle, DispatchError> {
        self.build_vtable(ty)?;
        dispatch::dispatch_interface(ty, declaration)
    }

    pub fn dispatch_by_name(&self, ty: &TypeHandle, name: &str) -> Result<MethodHandle, DispatchError> {
        self.build_vtable(ty)?;
        dispatch::dispatch_by_name(ty, name)
    }

    /// Attach the calling thread as a mutator that stops itself at safepoints.
    pub fn attach_thread(&self) -> MutatorHandle {
        self.stw.attach_mutator(false)
    }

    /// Attach the calling thread as a mutator the platform backend may stop at any instruction,
    /// where the suspend policy allows it.
    pub fn attach_preemptible_thread(&self) -> MutatorHandle {
        self.stw.attach_mutator(true)
    }

    /// Attach the calling thread as a collector worker. Workers are never suspended.
    pub fn attach_gc_worker(&self) -> MutatorHandle {
        self.stw.attach_gc_worker()
    }

    pub fn stop_world(&self, generation: u32) {
        self.stw.stop_world(generation)
    }

    /// Restart the world and return how long it was stopped.
    pub fn restart_world(&self, generation: u32) -> Duration {
        self.stw.restart_world(generation)
    }

    pub fn is_world_stopped(&self) -> bool {
        self.stw.is_world_stopped()
    }

    pub fn pause_stats(&self) -> PauseStats {
        self.stw.stats()
    }

    pub fn stop_the_world(&self) -> &StopTheWorld<VM::VMSuspend> {
        &self.stw
    }
}
