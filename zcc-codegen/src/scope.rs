//! Identifier scopes.
//!
//! A scope is a list of members with a parent chain; the chain is rendered
//! as a stack, pushed at function entry, at every brace-delimited block, at
//! for-loop headers and at record definitions, and popped on exit. Lookup
//! walks the stack from the innermost level outwards.
//!
//! There are two namespaces: *ordinary* identifiers (variables, arguments,
//! typedefs, enum elements, functions) and *tags* (struct/union/enum tags).
//! Insertion fails when the identifier already exists in the same scope and
//! namespace.

use crate::records::{EnumRef, RecordRef};
use crate::types::CGType;

/// What a scope member is.
#[derive(Clone, Debug)]
pub enum MemberKind {
    /// A global symbol (variable or function); carries its IR identifier.
    GlobalSym(String),
    /// A function argument; carries its IR identifier (`%0`, `%1`, ...).
    Arg(String),
    /// A local variable; carries its IR identifier.
    LocalVar(String),
    /// A typedef name.
    Typedef,
    /// A struct or union tag.
    RecordTag(RecordRef),
    /// An enum tag.
    EnumTag(EnumRef),
    /// An enum element with its value.
    EnumElem(EnumRef, i64),
}

impl MemberKind {
    /// Is this member in the tag namespace?
    pub fn is_tag(&self) -> bool {
        matches!(self, Self::RecordTag(_) | Self::EnumTag(_))
    }
}

/// One scope member.
#[derive(Clone, Debug)]
pub struct ScopeMember {
    /// The C identifier.
    pub ident: String,
    /// The member's type, when it has one.
    pub cgtype: Option<CGType>,
    /// What the member is.
    pub kind: MemberKind,
}

/// An insertion failure: the identifier already exists in the namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlreadyExists;

#[derive(Debug, Default)]
struct ScopeLevel {
    members: Vec<ScopeMember>,
}

/// The scope stack of one translation unit.
#[derive(Debug)]
pub struct ScopeStack {
    levels: Vec<ScopeLevel>,
}

impl ScopeStack {
    /// Create a stack holding only the file scope.
    pub fn new() -> Self {
        Self {
            levels: vec![ScopeLevel::default()],
        }
    }

    /// Enter a nested scope.
    pub fn push(&mut self) {
        self.levels.push(ScopeLevel::default());
    }

    /// Leave the innermost scope. The file scope is never popped.
    pub fn pop(&mut self) {
        debug_assert!(self.levels.len() > 1, "cannot pop the file scope");
        self.levels.pop();
    }

    /// Nesting depth, 1 for the file scope alone.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Insert a member into the innermost scope.
    pub fn insert(&mut self, member: ScopeMember) -> Result<(), AlreadyExists> {
        let level = self.levels.last_mut().expect("scope stack is never empty");
        let tag = member.kind.is_tag();
        if level
            .members
            .iter()
            .any(|m| m.ident == member.ident && m.kind.is_tag() == tag)
        {
            return Err(AlreadyExists);
        }
        level.members.push(member);
        Ok(())
    }

    /// Look up an ordinary identifier, walking outwards.
    pub fn lookup(&self, ident: &str) -> Option<&ScopeMember> {
        self.levels.iter().rev().find_map(|l| {
            l.members
                .iter()
                .rev()
                .find(|m| m.ident == ident && !m.kind.is_tag())
        })
    }

    /// Look up a record or enum tag, walking outwards.
    pub fn lookup_tag(&self, ident: &str) -> Option<&ScopeMember> {
        self.levels.iter().rev().find_map(|l| {
            l.members
                .iter()
                .rev()
                .find(|m| m.ident == ident && m.kind.is_tag())
        })
    }

    /// Look up an ordinary identifier in the innermost scope only.
    pub fn lookup_local(&self, ident: &str) -> Option<&ScopeMember> {
        self.levels
            .last()
            .and_then(|l| l.members.iter().rev().find(|m| m.ident == ident && !m.kind.is_tag()))
    }

    /// Look up a tag in the innermost scope only.
    pub fn lookup_tag_local(&self, ident: &str) -> Option<&ScopeMember> {
        self.levels
            .last()
            .and_then(|l| l.members.iter().rev().find(|m| m.ident == ident && m.kind.is_tag()))
    }

    /// How many declarations named `ident` exist anywhere on the stack.
    /// Used to pick disambiguation suffixes for shadowing locals.
    pub fn count_named(&self, ident: &str) -> usize {
        self.levels
            .iter()
            .flat_map(|l| l.members.iter())
            .filter(|m| m.ident == ident && !m.kind.is_tag())
            .count()
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> ScopeMember {
        ScopeMember {
            ident: name.to_string(),
            cgtype: Some(CGType::int()),
            kind: MemberKind::LocalVar(format!("%{}", name)),
        }
    }

    #[test]
    fn insert_and_lookup() {
        let mut scopes = ScopeStack::new();
        scopes.insert(var("x")).unwrap();
        assert!(scopes.lookup("x").is_some());
        assert!(scopes.lookup("y").is_none());
    }

    #[test]
    fn duplicate_in_same_scope_fails() {
        let mut scopes = ScopeStack::new();
        scopes.insert(var("x")).unwrap();
        assert_eq!(scopes.insert(var("x")), Err(AlreadyExists));
    }

    #[test]
    fn shadowing_in_inner_scope() {
        let mut scopes = ScopeStack::new();
        scopes.insert(var("x")).unwrap();
        scopes.push();
        scopes.insert(var("x")).unwrap();
        match &scopes.lookup("x").unwrap().kind {
            MemberKind::LocalVar(ir) => assert_eq!(ir, "%x"),
            _ => panic!(),
        }
        assert_eq!(scopes.count_named("x"), 2);
        scopes.pop();
        assert!(scopes.lookup("x").is_some());
        assert_eq!(scopes.count_named("x"), 1);
    }

    #[test]
    fn namespaces_are_independent() {
        let mut scopes = ScopeStack::new();
        scopes.insert(var("s")).unwrap();
        // A tag of the same name lives in the other namespace.
        scopes
            .insert(ScopeMember {
                ident: "s".to_string(),
                cgtype: None,
                kind: MemberKind::RecordTag(RecordRef::from_u32(0)),
            })
            .unwrap();
        assert!(matches!(
            scopes.lookup("s").unwrap().kind,
            MemberKind::LocalVar(_)
        ));
        assert!(matches!(
            scopes.lookup_tag("s").unwrap().kind,
            MemberKind::RecordTag(_)
        ));
    }

    #[test]
    fn local_lookup_ignores_outer_scopes() {
        let mut scopes = ScopeStack::new();
        scopes.insert(var("x")).unwrap();
        scopes.push();
        assert!(scopes.lookup_local("x").is_none());
        assert!(scopes.lookup("x").is_some());
    }
}
