use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;
use dataload_deferred::loaders::{
    ForeignKeyLoader, RecordSource, RelationLoader, RelationSource, Scope, ScopedSource, SingletonLoader,
};
use dataload_deferred::{Authorizer, BoxError, Deferred, ExecutionContext, Gate, LoadError};
use tracing_subscriber::EnvFilter;

// A toy school: submission id -> assignment id, assignment id -> attachment ids.
struct School {
    assignment_of: HashMap<u64, u64>,
    attachments: Vec<(u64, u64, &'static str)>,
    authors: HashMap<u64, &'static str>,
    media: HashMap<&'static str, &'static str>,
}

#[async_trait(?Send)]
impl RelationSource for School {
    type Parent = u64;
    type Related = u64;

    async fn load_relation(&self, model: &str, relation: &str, parents: &[u64]) -> Result<Vec<(u64, u64)>, BoxError> {
        println!("SELECT {relation} FROM {model} WHERE id IN {parents:?}");
        Ok(parents.iter().filter_map(|p| self.assignment_of.get(p).map(|a| (*p, *a))).collect())
    }
}

#[async_trait(?Send)]
impl ScopedSource for School {
    type Id = u64;
    type Row = &'static str;

    async fn load_scoped(
        &self,
        scope: &Scope,
        column: &str,
        ids: &[u64],
    ) -> Result<Vec<(u64, &'static str)>, BoxError> {
        let conditions = scope.conditions().collect::<Vec<_>>();
        println!("SELECT * FROM {} WHERE {conditions:?} AND {column} IN {ids:?}", scope.collection());
        let assignment = conditions.iter().find(|(name, _)| *name == "assignment_id").map(|(_, v)| v.to_string());
        Ok(self
            .attachments
            .iter()
            .filter(|(id, owner, _)| Some(owner.to_string()) == assignment && ids.contains(id))
            .map(|(id, _, name)| (*id, *name))
            .collect())
    }
}

struct Users(Rc<School>);

#[async_trait(?Send)]
impl RecordSource for Users {
    type Id = u64;
    type Record = &'static str;

    async fn load_records(&self, collection: &str, ids: &[u64]) -> Result<Vec<(u64, &'static str)>, BoxError> {
        println!("SELECT name FROM {collection} WHERE id IN {ids:?}");
        Ok(ids.iter().filter_map(|id| self.0.authors.get(id).map(|name| (*id, *name))).collect())
    }
}

struct Media(Rc<School>);

#[async_trait(?Send)]
impl RecordSource for Media {
    type Id = &'static str;
    type Record = &'static str;

    async fn load_records(
        &self,
        collection: &str,
        ids: &[&'static str],
    ) -> Result<Vec<(&'static str, &'static str)>, BoxError> {
        println!("GET /{collection}?ids={ids:?}");
        Ok(ids.iter().filter_map(|id| self.0.media.get(id).map(|m| (*id, *m))).collect())
    }
}

// Authors are hidden from everyone but teachers.
struct Policy;

impl Authorizer for Policy {
    type Actor = &'static str;
    type Resource = Option<u64>;
    type Action = &'static str;

    fn grants(&self, viewer: &&'static str, assignment: &Option<u64>, _action: &&'static str) -> bool {
        *viewer == "teacher" && assignment.is_some()
    }
}

#[derive(Clone)]
struct Comment {
    submission_id: u64,
    author_id: u64,
    attachment_ids: Vec<u64>,
    media_comment_id: Option<&'static str>,
}

#[derive(Debug, Clone)]
struct ResolvedComment {
    author: Option<&'static str>,
    attachments: Vec<&'static str>,
    media: Option<&'static str>,
}

fn resolve_comment(
    ctx: &ExecutionContext,
    school: &Rc<School>,
    gate: &Gate<Policy>,
    comment: Comment,
) -> Result<Deferred<ResolvedComment>, LoadError> {
    let assignments = ctx.loader(RelationLoader::new(Rc::clone(school), "Submission", "assignment")?)?;
    let users = ctx.loader(SingletonLoader::new(Rc::new(Users(Rc::clone(school))), "users")?)?;
    let media = ctx.loader(SingletonLoader::new(Rc::new(Media(Rc::clone(school))), "media_objects")?)?;

    let assignment = assignments.load(comment.submission_id);
    let author = gate.reveal(users.load(comment.author_id).join(&assignment), "read_author", |(author, assignment)| {
        (assignment, author)
    });

    let school = Rc::clone(school);
    let ctx_for_attachments = ctx.clone();
    let ids = comment.attachment_ids.clone();
    let attachments = assignment.then(move |assignment| match assignment {
        Some(assignment) if !ids.is_empty() => {
            let scope = Scope::new("attachments").filter("assignment_id", assignment);
            match ForeignKeyLoader::new(school, scope, "id").and_then(|fk| ctx_for_attachments.loader(fk)) {
                Ok(loader) => loader.load_flat(ids),
                Err(err) => Deferred::failed(err),
            }
        }
        _ => Deferred::resolved(Vec::new()),
    });

    let media = media.load_optional(comment.media_comment_id);
    Ok(author
        .join(&attachments)
        .join(&media)
        .map(|((author, attachments), media)| ResolvedComment { author, attachments, media }))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), LoadError> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let school = Rc::new(School {
        assignment_of: HashMap::from([(1, 100), (2, 100), (3, 200)]),
        attachments: vec![(10, 100, "rubric.pdf"), (11, 200, "answers.pdf"), (12, 100, "notes.txt")],
        authors: HashMap::from([(7, "Ada"), (8, "Grace")]),
        media: HashMap::from([("m1", "voice-note.ogg")]),
    });
    let comments = vec![
        Comment { submission_id: 1, author_id: 7, attachment_ids: vec![10, 11], media_comment_id: Some("m1") },
        Comment { submission_id: 2, author_id: 8, attachment_ids: vec![12], media_comment_id: None },
        Comment { submission_id: 3, author_id: 7, attachment_ids: vec![], media_comment_id: Some("m2") },
    ];

    for viewer in ["teacher", "student"] {
        println!("--- as {viewer}");
        let ctx = ExecutionContext::default();
        let gate = Gate::new(Rc::new(Policy), viewer);
        let resolved = comments
            .iter()
            .cloned()
            .map(|comment| resolve_comment(&ctx, &school, &gate, comment))
            .collect::<Result<Vec<_>, _>>()?;

        for comment in ctx.resolve(Deferred::all(resolved)).await? {
            println!("{comment:?}");
        }
        println!("{} ticks", ctx.ticks());
        ctx.finish();
    }
    Ok(())
}
