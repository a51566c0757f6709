//! The type algebra shared by typing rules and derivations.
//!
//! Types are small first-order terms: named base types, right-associative
//! function arrows and canonicalized unions. Typing contexts are persistent:
//! extending one yields a new context that shares structure with the old, so
//! every live derivation can carry its own scope cheaply.

use std::fmt;
use std::sync::Arc;

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{alpha1, alphanumeric1, multispace0};
use nom::combinator::{all_consuming, map, recognize};
use nom::multi::{many0, separated_list1};
use nom::sequence::{delimited, pair, preceded, terminated};
use nom::IResult;

/// A term in the type algebra.
///
/// Unions are kept canonical: flattened, sorted and deduplicated, with
/// single-branch unions collapsed. Construct them through [`Type::union`] to
/// preserve this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    /// A named base type such as `Int` or `Fizz`.
    Base(Arc<str>),
    /// A function type `A -> B`.
    Arrow(Box<Type>, Box<Type>),
    /// A canonicalized union `A | B`.
    Union(Vec<Type>),
}

impl Type {
    /// A base type with the given name.
    pub fn base(name: &str) -> Type {
        Type::Base(Arc::from(name))
    }

    /// The function type `from -> to`.
    pub fn arrow(from: Type, to: Type) -> Type {
        Type::Arrow(Box::new(from), Box::new(to))
    }

    /// The canonical union of `branches`.
    pub fn union(branches: Vec<Type>) -> Type {
        fn flatten(ty: Type, out: &mut Vec<Type>) {
            match ty {
                Type::Union(inner) => inner.into_iter().for_each(|t| flatten(t, out)),
                other => out.push(other),
            }
        }
        let mut flat = Vec::with_capacity(branches.len());
        branches.into_iter().for_each(|t| flatten(t, &mut flat));
        flat.sort();
        flat.dedup();
        if flat.len() == 1 {
            flat.pop().unwrap()
        } else {
            Type::Union(flat)
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Base(name) => write!(f, "{name}"),
            Type::Arrow(from, to) => {
                match from.as_ref() {
                    arrow @ Type::Arrow(..) => write!(f, "({arrow})")?,
                    other => write!(f, "{other}")?,
                }
                write!(f, "->{to}")
            }
            Type::Union(branches) => {
                for (i, branch) in branches.iter().enumerate() {
                    if i > 0 {
                        write!(f, "|")?;
                    }
                    match branch {
                        arrow @ Type::Arrow(..) => write!(f, "({arrow})")?,
                        other => write!(f, "{other}")?,
                    }
                }
                Ok(())
            }
        }
    }
}

/// Structural equality up to union branching: two types are compatible when
/// they are equal, or when either side is a union with a compatible branch.
pub fn types_compatible(a: &Type, b: &Type) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Type::Arrow(a1, a2), Type::Arrow(b1, b2)) => {
            types_compatible(a1, b1) && types_compatible(a2, b2)
        }
        (Type::Union(branches), other) | (other, Type::Union(branches)) => {
            branches.iter().any(|branch| types_compatible(branch, other))
        }
        _ => false,
    }
}

/// The error type for malformed type annotations.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid type annotation `{text}`")]
pub struct TypeParseError {
    /// The annotation text that failed to parse.
    pub text: String,
}

fn type_ident(input: &str) -> IResult<&str, &str> {
    recognize(pair(alpha1, many0(alt((alphanumeric1, tag("_"))))))(input)
}

fn ty_atom(input: &str) -> IResult<&str, Type> {
    preceded(
        multispace0,
        alt((
            map(type_ident, Type::base),
            delimited(tag("("), ty_arrow, preceded(multispace0, tag(")"))),
        )),
    )(input)
}

fn ty_union(input: &str) -> IResult<&str, Type> {
    map(
        separated_list1(preceded(multispace0, tag("|")), ty_atom),
        Type::union,
    )(input)
}

fn ty_arrow(input: &str) -> IResult<&str, Type> {
    let (rest, head) = ty_union(input)?;
    let (rest, _) = multispace0(rest)?;
    match tag::<_, _, nom::error::Error<&str>>("->")(rest) {
        Ok((rest, _)) => {
            let (rest, tail) = ty_arrow(rest)?;
            Ok((rest, Type::arrow(head, tail)))
        }
        Err(_) => Ok((rest, head)),
    }
}

/// Parses a type annotation such as `Int`, `(Int->Bool)->Int` or `Int|Bool`.
/// Arrows are right-associative and bind loosest; unions bind tighter.
pub fn parse_type(text: &str) -> Result<Type, TypeParseError> {
    all_consuming(terminated(ty_arrow, multispace0))(text)
        .map(|(_, ty)| ty)
        .map_err(|_| TypeParseError {
            text: text.to_string(),
        })
}

#[derive(Debug)]
struct EnvNode {
    name: Arc<str>,
    ty: Type,
    next: Option<Arc<EnvNode>>,
}

/// A typing context Γ: a persistent map from identifier to [`Type`].
///
/// `extend` is O(1) and shares the tail with the parent context; lookups walk
/// inner bindings first, so rebinding a name shadows the outer entry.
#[derive(Clone, Default)]
pub struct TypeEnv {
    head: Option<Arc<EnvNode>>,
}

impl TypeEnv {
    /// The empty context.
    pub fn new() -> TypeEnv {
        TypeEnv::default()
    }

    /// Returns a new context with `name` bound to `ty`, sharing this one.
    #[must_use]
    pub fn extend(&self, name: Arc<str>, ty: Type) -> TypeEnv {
        TypeEnv {
            head: Some(Arc::new(EnvNode {
                name,
                ty,
                next: self.head.clone(),
            })),
        }
    }

    /// The type bound to `name`, innermost binding first.
    pub fn lookup(&self, name: &str) -> Option<&Type> {
        self.iter()
            .find(|(bound, _)| *bound == name)
            .map(|(_, ty)| ty)
    }

    /// Whether any bound identifier starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.iter().any(|(name, _)| name.starts_with(prefix))
    }

    /// Whether the context has no bindings.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Iterates over bindings from innermost to outermost. Shadowed entries
    /// are yielded too; callers that need the visible map should keep the
    /// first occurrence of each name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Type)> {
        struct Iter<'a>(Option<&'a EnvNode>);
        impl<'a> Iterator for Iter<'a> {
            type Item = (&'a str, &'a Type);
            fn next(&mut self) -> Option<Self::Item> {
                let node = self.0?;
                self.0 = node.next.as_deref();
                Some((&node.name, &node.ty))
            }
        }
        Iter(self.head.as_deref())
    }
}

impl fmt::Debug for TypeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, ty) in self.iter() {
            map.entry(&name, &ty.to_string());
        }
        map.finish()
    }
}

/// A typing-rule pattern: a type with metavariable holes, produced by
/// instantiating a rule's type expression against a derivation's children.
#[derive(Debug, Clone)]
pub(crate) enum TyPat {
    /// A fully concrete type.
    Ty(Type),
    /// A rule-local metavariable.
    Var(Arc<str>),
    /// An arrow with holes on either side.
    Arrow(Box<TyPat>, Box<TyPat>),
    /// A union with holes in its branches.
    Union(Vec<TyPat>),
}

/// Rule-local metavariable bindings, kept per live derivation.
pub(crate) type Subst = Vec<(Arc<str>, Type)>;

fn lookup_subst(subst: &Subst, name: &str) -> Option<Type> {
    subst
        .iter()
        .find(|(bound, _)| bound.as_ref() == name)
        .map(|(_, ty)| ty.clone())
}

/// First-order unification of a pattern against a concrete type. On success
/// the substitution is extended in place; on failure it is left unchanged.
pub(crate) fn unify(pat: &TyPat, ty: &Type, subst: &mut Subst) -> bool {
    match pat {
        TyPat::Ty(concrete) => types_compatible(concrete, ty),
        TyPat::Var(name) => match lookup_subst(subst, name) {
            Some(bound) => types_compatible(&bound, ty),
            None => {
                subst.push((name.clone(), ty.clone()));
                true
            }
        },
        TyPat::Arrow(from, to) => match ty {
            Type::Arrow(ty_from, ty_to) => {
                let mut trial = subst.clone();
                if unify(from, ty_from, &mut trial) && unify(to, ty_to, &mut trial) {
                    *subst = trial;
                    true
                } else {
                    false
                }
            }
            Type::Union(branches) => branches.iter().any(|branch| {
                let mut trial = subst.clone();
                if unify(pat, branch, &mut trial) {
                    *subst = trial;
                    true
                } else {
                    false
                }
            }),
            _ => false,
        },
        TyPat::Union(pats) => pats.iter().any(|branch| {
            let mut trial = subst.clone();
            if unify(branch, ty, &mut trial) {
                *subst = trial;
                true
            } else {
                false
            }
        }),
    }
}

/// Resolves a pattern to a concrete type, failing when a metavariable is
/// still unbound.
pub(crate) fn resolve_pat(pat: &TyPat, subst: &Subst) -> Option<Type> {
    match pat {
        TyPat::Ty(ty) => Some(ty.clone()),
        TyPat::Var(name) => lookup_subst(subst, name),
        TyPat::Arrow(from, to) => Some(Type::arrow(
            resolve_pat(from, subst)?,
            resolve_pat(to, subst)?,
        )),
        TyPat::Union(pats) => pats
            .iter()
            .map(|p| resolve_pat(p, subst))
            .collect::<Option<Vec<_>>>()
            .map(Type::union),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrows_are_right_associative() {
        let ty = parse_type("Int->Bool->Int").unwrap();
        assert_eq!(
            ty,
            Type::arrow(
                Type::base("Int"),
                Type::arrow(Type::base("Bool"), Type::base("Int"))
            )
        );
        assert_eq!(ty.to_string(), "Int->Bool->Int");
    }

    #[test]
    fn parenthesized_arrow_on_the_left() {
        let ty = parse_type("(Int->Bool)->Int").unwrap();
        assert_eq!(ty.to_string(), "(Int->Bool)->Int");
    }

    #[test]
    fn unions_are_canonical() {
        let a = parse_type("Int|Bool").unwrap();
        let b = parse_type("Bool|Int|Bool").unwrap();
        assert_eq!(a, b);
        assert_eq!(Type::union(vec![Type::base("Int")]), Type::base("Int"));
    }

    #[test]
    fn union_unifies_with_its_branches() {
        let union = parse_type("Int|Bool").unwrap();
        assert!(types_compatible(&union, &Type::base("Bool")));
        assert!(types_compatible(&Type::base("Int"), &union));
        assert!(!types_compatible(&union, &Type::base("Float")));
    }

    #[test]
    fn metavariables_bind_once() {
        // ?a -> ?a against Int -> Bool must fail; against Int -> Int it binds.
        let pat = TyPat::Arrow(
            Box::new(TyPat::Var(Arc::from("a"))),
            Box::new(TyPat::Var(Arc::from("a"))),
        );
        let mut subst = Subst::new();
        assert!(!unify(
            &pat,
            &Type::arrow(Type::base("Int"), Type::base("Bool")),
            &mut subst
        ));
        assert!(subst.is_empty());
        assert!(unify(
            &pat,
            &Type::arrow(Type::base("Int"), Type::base("Int")),
            &mut subst
        ));
        assert_eq!(
            resolve_pat(&TyPat::Var(Arc::from("a")), &subst),
            Some(Type::base("Int"))
        );
    }

    #[test]
    fn env_extension_shares_and_shadows() {
        let outer = TypeEnv::new().extend(Arc::from("x"), Type::base("Int"));
        let inner = outer.extend(Arc::from("x"), Type::base("Bool"));
        assert_eq!(outer.lookup("x"), Some(&Type::base("Int")));
        assert_eq!(inner.lookup("x"), Some(&Type::base("Bool")));
        assert!(inner.has_prefix("x"));
        assert!(!inner.has_prefix("y"));
    }
}
