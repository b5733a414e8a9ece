use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::TypeHandle;

/// A type as it appears in a method signature.
#[derive(Clone)]
pub enum SigType {
    Void,
    /// A type known only by name, such as a primitive. Two named types are equal when their
    /// names are.
    Named(Arc<str>),
    /// A loaded type. Compared by identity.
    Type(TypeHandle),
    /// A reference the type system could not resolve. Comparing it fails.
    Unresolved(Arc<str>),
}

impl SigType {
    pub fn named(name: &str) -> Self {
        SigType::Named(name.into())
    }

    pub fn unresolved(name: &str) -> Self {
        SigType::Unresolved(name.into())
    }
}

impl PartialEq for SigType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SigType::Void, SigType::Void) => true,
            (SigType::Named(a), SigType::Named(b)) => a == b,
            (SigType::Type(a), SigType::Type(b)) => Arc::ptr_eq(a, b),
            (SigType::Unresolved(a), SigType::Unresolved(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for SigType {}

impl Hash for SigType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            SigType::Void => {}
            SigType::Named(n) | SigType::Unresolved(n) => n.hash(state),
            SigType::Type(t) => (Arc::as_ptr(t) as usize).hash(state),
        }
    }
}

impl fmt::Display for SigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigType::Void => write!(f, "void"),
            SigType::Named(n) => write!(f, "{}", n),
            SigType::Type(t) => write!(f, "{}", t.full_name()),
            SigType::Unresolved(n) => write!(f, "?{}", n),
        }
    }
}

impl fmt::Debug for SigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Parameter types and return type of a method.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MethodSignature {
    pub params: Vec<SigType>,
    pub ret: SigType,
}

impl MethodSignature {
    pub fn new(params: Vec<SigType>, ret: SigType) -> Self {
        MethodSignature { params, ret }
    }

    /// `void ()`.
    pub fn void() -> Self {
        MethodSignature {
            params: vec![],
            ret: SigType::Void,
        }
    }

    /// The first unresolved type the signature mentions.
    pub fn first_unresolved(&self) -> Option<&str> {
        self.params
            .iter()
            .chain(std::iter::once(&self.ret))
            .find_map(|t| match t {
                SigType::Unresolved(n) => Some(&**n),
                _ => None,
            })
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.ret)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ")")
    }
}

/// How the signature of an overriding method relates to the one it would override.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignatureRelation {
    Equal,
    /// Same parameters, and the return type is a narrower type than the other's.
    Covariant,
    Unrelated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let sig = MethodSignature::new(
            vec![SigType::named("int"), SigType::named("string")],
            SigType::Void,
        );
        assert_eq!(sig.to_string(), "void (int, string)");
    }

    #[test]
    fn finds_unresolved_types() {
        let sig = MethodSignature::new(vec![SigType::named("int")], SigType::unresolved("Missing"));
        assert_eq!(sig.first_unresolved(), Some("Missing"));
        assert_eq!(MethodSignature::void().first_unresolved(), None);
    }
}
