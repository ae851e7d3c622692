use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

use async_trait::async_trait;

use crate::{
    batch_function::{BatchFunction, Loaded},
    deferred::Deferred,
    error::{BoxError, LoadError},
    identity::{LoaderIdentity, LoaderKind},
    loader::Loader,
};

/// An allow-listed set of rows: a collection narrowed by equality conditions.
///
/// Only rows inside the scope can ever be returned by a [`ForeignKeyLoader`], whatever ids a
/// caller asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    collection: String,
    conditions: Vec<(String, String)>,
}

impl Scope {
    pub fn new(collection: impl Into<String>) -> Self {
        Self { collection: collection.into(), conditions: Vec::new() }
    }

    /// Narrows the scope to rows whose `column` equals `value`.
    pub fn filter(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.conditions.push((column.into(), value.to_string()));
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.conditions.iter().map(|(column, value)| (column.as_str(), value.as_str()))
    }
}

/// A source that runs `scope AND column IN (ids)` as one query.
#[async_trait(?Send)]
pub trait ScopedSource: 'static {
    type Id: 'static + Clone + Eq + Hash + Debug;
    type Row: 'static + Clone + Debug;

    /// Returns every row of `scope` whose `column` is one of `ids`, paired with that id.
    async fn load_scoped(
        &self,
        scope: &Scope,
        column: &str,
        ids: &[Self::Id],
    ) -> Result<Vec<(Self::Id, Self::Row)>, BoxError>;
}

/// Loads the rows of a scope matching a set of foreign key values.
///
/// Each id resolves to its matching rows, or to `None` when the scope holds no row for it.
/// Use [`Loader::load_flat`] to get the rows of many ids as one flat list.
pub struct ForeignKeyLoader<S> {
    source: Rc<S>,
    scope: Scope,
    column: String,
    identity: LoaderIdentity,
}

impl<S: ScopedSource> ForeignKeyLoader<S> {
    pub fn new(source: Rc<S>, scope: Scope, column: &str) -> Result<Self, LoadError> {
        let qualifiers = std::iter::once(("column".to_owned(), column.to_owned()))
            .chain(scope.conditions().map(|(name, value)| (format!("where.{name}"), value.to_owned())));
        let identity = LoaderIdentity::canonicalize(LoaderKind::ForeignKey, scope.collection(), qualifiers)?;
        Ok(Self { source, scope, column: column.to_owned(), identity })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

#[async_trait(?Send)]
impl<S: ScopedSource> BatchFunction for ForeignKeyLoader<S> {
    type Key = S::Id;
    type Value = Vec<S::Row>;

    fn identity(&self) -> &LoaderIdentity {
        &self.identity
    }

    async fn load(&self, keys: &[S::Id]) -> Result<Loaded<S::Id, Vec<S::Row>>, BoxError> {
        let rows = self.source.load_scoped(&self.scope, &self.column, keys).await?;

        let mut groups: Vec<(S::Id, Vec<S::Row>)> = Vec::new();
        let mut slots: HashMap<S::Id, usize> = HashMap::new();
        for (id, row) in rows {
            match slots.get(&id).copied() {
                Some(slot) => groups[slot].1.push(row),
                None => {
                    slots.insert(id.clone(), groups.len());
                    groups.push((id, vec![row]));
                }
            }
        }
        Ok(Loaded::Keyed(groups))
    }
}

impl<S: ScopedSource> Loader<ForeignKeyLoader<S>> {
    /// Loads the rows of every id as one flat list.
    ///
    /// Repeated ids are loaded once, ids without rows contribute nothing, and rows keep the
    /// order of the first occurrence of their id.
    pub fn load_flat<I>(&self, ids: I) -> Deferred<Vec<S::Row>>
    where
        I: IntoIterator<Item = S::Id>,
    {
        let mut seen = HashSet::new();
        let ids = ids.into_iter().filter(|id| seen.insert(id.clone())).collect::<Vec<_>>();
        self.load_many(ids).map(|groups| groups.into_iter().flatten().flatten().collect())
    }
}
