use crate::error::UnresolvedType;
use crate::loader::{MethodDesc, MethodSignature, SigType, SignatureRelation, TypeDesc, TypeHandle};

/// The questions the loader asks about types and signatures.
///
/// Enumerating methods, interfaces and the class hierarchy is done directly on
/// [`TypeDesc`](crate::loader::TypeDesc); this trait covers the judgements a runtime may want
/// to make differently.
pub trait TypeSystem: Send + Sync + 'static {
    /// How `candidate` relates to `target` when `candidate` would override or implement it.
    /// `Covariant` means equal parameters and a return type of `candidate` assignable to the one
    /// of `target`.
    fn compare_signatures(
        &self,
        candidate: &MethodSignature,
        target: &MethodSignature,
    ) -> Result<SignatureRelation, UnresolvedType>;

    /// Whether a value of type `from` can be used where `to` is expected.
    fn is_assignable_to(&self, from: &SigType, to: &SigType) -> Result<bool, UnresolvedType>;

    /// Whether `overrider` may take the slot of `overridden`.
    fn can_override(&self, _overrider: &MethodDesc, overridden: &MethodDesc) -> bool {
        !overridden.is_private()
    }

    /// Whether `method` may implicitly implement an interface method.
    fn can_implement(&self, method: &MethodDesc, _interface_method: &MethodDesc) -> bool {
        method.is_public()
    }

    /// Substitute `args` into `ty`, a type mentioned by a generic definition. The result must be
    /// a type that is already defined.
    fn inflate(&self, ty: &TypeHandle, _args: &[TypeHandle]) -> TypeHandle {
        ty.clone()
    }
}

/// Signatures compare structurally; assignability follows the parent chain and the declared
/// interfaces of loaded types.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultTypeSystem;

fn check(t: &SigType) -> Result<(), UnresolvedType> {
    match t {
        SigType::Unresolved(name) => Err(UnresolvedType {
            name: name.to_string(),
        }),
        _ => Ok(()),
    }
}

fn implements(ty: &TypeDesc, iface: &TypeDesc) -> bool {
    ty.extends_interface(iface) || ty.ancestors().any(|a| a.extends_interface(iface))
}

impl TypeSystem for DefaultTypeSystem {
    fn compare_signatures(
        &self,
        candidate: &MethodSignature,
        target: &MethodSignature,
    ) -> Result<SignatureRelation, UnresolvedType> {
        for t in candidate
            .params
            .iter()
            .chain(target.params.iter())
            .chain([&candidate.ret, &target.ret])
        {
            check(t)?;
        }
        if candidate.params != target.params {
            return Ok(SignatureRelation::Unrelated);
        }
        if candidate.ret == target.ret {
            return Ok(SignatureRelation::Equal);
        }
        if self.is_assignable_to(&candidate.ret, &target.ret)? {
            Ok(SignatureRelation::Covariant)
        } else {
            Ok(SignatureRelation::Unrelated)
        }
    }

    fn is_assignable_to(&self, from: &SigType, to: &SigType) -> Result<bool, UnresolvedType> {
        check(from)?;
        check(to)?;
        if from == to {
            return Ok(true);
        }
        Ok(match (from, to) {
            (SigType::Type(from), SigType::Type(to)) => {
                if to.is_interface() {
                    implements(from, to)
                } else {
                    from.is_subclass_of(to)
                }
            }
            _ => false,
        })
    }
}
