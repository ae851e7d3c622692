use std::collections::BTreeMap;
use std::fmt;

use crate::error::LoadError;

/// The batch-fetch strategy a loader uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LoaderKind {
    /// Loads a named relation for a batch of parents.
    Relation,
    /// Loads rows of an allow-listed scope whose column matches a batch of ids.
    ForeignKey,
    /// Loads single records by external id.
    Singleton,
    /// Any other [`BatchFunction`](crate::BatchFunction), named by its author.
    Custom(&'static str),
}

impl LoaderKind {
    /// Qualifiers an identity of this kind can not be built without.
    fn required_qualifiers(&self) -> &'static [&'static str] {
        match self {
            LoaderKind::Relation => &["relation"],
            LoaderKind::ForeignKey => &["column"],
            LoaderKind::Singleton | LoaderKind::Custom(_) => &[],
        }
    }
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderKind::Relation => f.write_str("relation"),
            LoaderKind::ForeignKey => f.write_str("foreign_key"),
            LoaderKind::Singleton => f.write_str("singleton"),
            LoaderKind::Custom(name) => f.write_str(name),
        }
    }
}

/// Canonical name of a batching bucket: loader kind, target collection or relation owner, and
/// the extra qualifiers that select one particular loader.
///
/// Identities compare by value. Qualifiers are kept sorted, so the order in which callers pass
/// them does not matter: two resolvers asking for `relation:Submission[relation=assignment]`
/// end up in the same batch and share cached outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderIdentity {
    kind: LoaderKind,
    target: String,
    qualifiers: BTreeMap<String, String>,
}

impl LoaderIdentity {
    /// Builds the identity for `kind` over `target` with the given qualifiers.
    ///
    /// Fails with [`LoadError::MalformedRequest`] when the target or a qualifier name is blank,
    /// when a qualifier is given twice with different values, or when a qualifier required by
    /// `kind` is missing.
    pub fn canonicalize<I, N, V>(kind: LoaderKind, target: impl Into<String>, params: I) -> Result<Self, LoadError>
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        let target = target.into();
        if target.trim().is_empty() {
            return Err(LoadError::MalformedRequest(format!("{kind} loader has an empty target")));
        }
        if let LoaderKind::Custom(name) = kind {
            if name.trim().is_empty() {
                return Err(LoadError::MalformedRequest(format!("custom loader for {target} has no name")));
            }
        }

        let mut qualifiers = BTreeMap::new();
        for (name, value) in params {
            let name = name.into();
            let value = value.into();
            if name.trim().is_empty() {
                return Err(LoadError::MalformedRequest(format!(
                    "{kind} loader for {target} has a qualifier with an empty name"
                )));
            }
            match qualifiers.get(&name) {
                Some(existing) if *existing != value => {
                    return Err(LoadError::MalformedRequest(format!(
                        "{kind} loader for {target} has conflicting values for {name}: {existing:?} and {value:?}"
                    )));
                }
                Some(_) => {}
                None => {
                    qualifiers.insert(name, value);
                }
            }
        }

        for required in kind.required_qualifiers() {
            match qualifiers.get(*required) {
                Some(value) if !value.trim().is_empty() => {}
                _ => {
                    return Err(LoadError::MalformedRequest(format!(
                        "{kind} loader for {target} is missing required qualifier {required}"
                    )));
                }
            }
        }

        Ok(Self { kind, target, qualifiers })
    }

    /// Builds an identity that carries no qualifiers.
    pub fn unqualified(kind: LoaderKind, target: impl Into<String>) -> Result<Self, LoadError> {
        Self::canonicalize(kind, target, std::iter::empty::<(String, String)>())
    }

    pub fn kind(&self) -> LoaderKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn qualifier(&self, name: &str) -> Option<&str> {
        self.qualifiers.get(name).map(String::as_str)
    }

    pub fn qualifiers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.qualifiers.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl fmt::Display for LoaderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.target)?;
        if !self.qualifiers.is_empty() {
            f.write_str("[")?;
            for (i, (name, value)) in self.qualifiers.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{name}={value}")?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}
