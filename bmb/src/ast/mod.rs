//! Abstract Syntax Tree definitions

mod expr;
mod span;
mod types;

pub use expr::*;
pub use span::*;
pub use types::*;

use serde::{Deserialize, Serialize};

/// A program is a sequence of top-level items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub items: Vec<Item>,
}

impl Program {
    /// Iterate over the function definitions in declaration order.
    pub fn functions(&self) -> impl Iterator<Item = &FnDef> {
        self.items.iter().filter_map(|item| match item {
            Item::FnDef(f) => Some(f),
            _ => None,
        })
    }
}

/// Top-level item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Item {
    FnDef(FnDef),
    StructDef(StructDef),
    EnumDef(EnumDef),
    TraitDef(TraitDef),
    ImplBlock(ImplBlock),
    Use(UseDecl),
}

/// Item visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

/// Generic type parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeParam {
    pub name: Spanned<String>,
}

/// Struct definition, optionally generic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructDef {
    pub name: Spanned<String>,
    pub type_params: Vec<TypeParam>,
    pub fields: Vec<StructField>,
    pub visibility: Visibility,
    pub span: Span,
}

/// Struct field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructField {
    pub name: Spanned<String>,
    pub ty: Spanned<Type>,
}

/// Enum definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumDef {
    pub name: Spanned<String>,
    pub type_params: Vec<TypeParam>,
    pub variants: Vec<EnumVariantDef>,
    pub visibility: Visibility,
    pub span: Span,
}

/// Enum variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumVariantDef {
    pub name: Spanned<String>,
    /// Payload types for tuple-like variants (empty for unit variants)
    pub fields: Vec<Spanned<Type>>,
}

/// Trait definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitDef {
    pub name: Spanned<String>,
    pub methods: Vec<TraitMethod>,
    pub visibility: Visibility,
    pub span: Span,
}

/// A method signature inside a trait
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitMethod {
    pub name: Spanned<String>,
    pub params: Vec<Param>,
    pub ret_ty: Spanned<Type>,
}

/// Impl block: `impl TraitName for TypeName { fns }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplBlock {
    pub trait_name: Spanned<String>,
    pub target: Spanned<Type>,
    pub methods: Vec<FnDef>,
    pub span: Span,
}

/// Use declaration (module import)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UseDecl {
    pub path: Spanned<String>,
    pub span: Span,
}

/// Function attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    /// @pure: no side effects, callable inside contracts
    Pure,
    /// @inline: prefer inlining
    Inline,
    /// @trust: skip SMT discharge, keep the contract for callers
    Trust { reason: Option<String> },
    /// @decreases(expr): termination measure for recursive functions
    Decreases(Spanned<Expr>),
}

impl Attribute {
    pub fn is_trust(&self) -> bool {
        matches!(self, Attribute::Trust { .. })
    }

    pub fn is_pure(&self) -> bool {
        matches!(self, Attribute::Pure)
    }
}

/// A named contract clause from a `where { name: expr, ... }` block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedContract {
    pub name: Option<Spanned<String>>,
    pub condition: Spanned<Expr>,
}

/// Function definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FnDef {
    pub name: Spanned<String>,
    pub type_params: Vec<TypeParam>,
    pub params: Vec<Param>,
    pub ret_ty: Spanned<Type>,
    /// Preconditions, in declaration order
    pub pre: Vec<Spanned<Expr>>,
    /// Postconditions, in declaration order (may reference `ret`, `old(..)`)
    pub post: Vec<Spanned<Expr>>,
    /// Named `where { ... }` clauses
    pub contracts: Vec<NamedContract>,
    pub attributes: Vec<Attribute>,
    pub visibility: Visibility,
    pub body: Spanned<Expr>,
    pub span: Span,
}

impl FnDef {
    pub fn is_pure(&self) -> bool {
        self.attributes.iter().any(Attribute::is_pure)
    }

    pub fn is_trusted(&self) -> bool {
        self.attributes.iter().any(Attribute::is_trust)
    }

    pub fn decreases(&self) -> Option<&Spanned<Expr>> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Decreases(e) => Some(e),
            _ => None,
        })
    }

    /// Whether any contract machinery is attached to this function,
    /// including refinement types on parameters or the return type.
    pub fn has_contracts(&self) -> bool {
        !self.pre.is_empty()
            || !self.post.is_empty()
            || !self.contracts.is_empty()
            || self.decreases().is_some()
            || matches!(self.ret_ty.node, Type::Refined { .. })
            || self
                .params
                .iter()
                .any(|p| matches!(p.ty.node, Type::Refined { .. }))
    }
}

/// Function parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: Spanned<String>,
    pub ty: Spanned<Type>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_fn(attrs: Vec<Attribute>) -> FnDef {
        FnDef {
            name: Spanned::new("f".into(), Span::dummy()),
            type_params: vec![],
            params: vec![],
            ret_ty: Spanned::new(Type::I64, Span::dummy()),
            pre: vec![],
            post: vec![],
            contracts: vec![],
            attributes: attrs,
            visibility: Visibility::Private,
            body: Spanned::new(Expr::IntLit(0), Span::dummy()),
            span: Span::dummy(),
        }
    }

    #[test]
    fn test_fn_attribute_queries() {
        let f = dummy_fn(vec![Attribute::Pure, Attribute::Trust { reason: None }]);
        assert!(f.is_pure());
        assert!(f.is_trusted());
        assert!(f.decreases().is_none());
    }

    #[test]
    fn test_has_contracts_via_refined_param() {
        let mut f = dummy_fn(vec![]);
        assert!(!f.has_contracts());
        f.params.push(Param {
            name: Spanned::new("b".into(), Span::dummy()),
            ty: Spanned::new(
                Type::Refined {
                    base: Box::new(Type::I64),
                    constraints: vec![],
                },
                Span::dummy(),
            ),
        });
        assert!(f.has_contracts());
    }

    #[test]
    fn test_program_functions_iter() {
        let prog = Program {
            items: vec![
                Item::FnDef(dummy_fn(vec![])),
                Item::Use(UseDecl {
                    path: Spanned::new("std".into(), Span::dummy()),
                    span: Span::dummy(),
                }),
            ],
        };
        assert_eq!(prog.functions().count(), 1);
    }
}
