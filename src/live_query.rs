//! Live-query collection (§4.9): a compiled query bound to one or more
//! backing collections. Preloads each source's current snapshot, runs the
//! graph to quiescence, then stays subscribed to every source's change
//! stream for as long as it is alive, translating each incoming batch into
//! a graph push -> `run` -> `drain_output` -> sync-session commit on its
//! own result collection.
//!
//! This is the single piece of glue code the compiled, source-agnostic
//! graph (`crate::graph`) and the synced, source-agnostic collection
//! (`crate::collection`) don't know about each other without.

use crate::change::ChangeMessage;
use crate::collection::{Collection, CollectionOptions};
use crate::compiler::{self, CompiledQuery};
use crate::error::D2Error;
use crate::graph::{EdgeId, Graph};
use crate::ir::{OrderByClause, QueryIr};
use crate::multiset::Multiset;
use crate::row::{GetKey, Key, Row, Value};
use fnv::FnvHashMap;
use std::sync::{Arc, Mutex};

pub struct LiveQueryCollection {
    compiled: Mutex<CompiledQuery>,
    sources: FnvHashMap<String, Arc<Collection>>,
    output: Arc<Collection>,
    listener_ids: Mutex<Vec<(String, u64)>>,
}

impl LiveQueryCollection {
    /// Compiles `query`, binds each alias it references to a collection in
    /// `sources`, and preloads from every source's current snapshot.
    pub fn new(query: &QueryIr, sources: FnvHashMap<String, Arc<Collection>>) -> Result<Arc<LiveQueryCollection>, D2Error> {
        let compiled = compiler::compile(query)?;
        for (alias, collection_name) in &compiled.source_collections {
            if !sources.contains_key(alias) {
                return Err(D2Error::QueryShapeError(format!(
                    "no source collection bound for alias `{alias}` (collection `{collection_name}`)"
                )));
            }
        }
        let output = Collection::new(CollectionOptions::new(synthetic_get_key()));
        let lq = Arc::new(LiveQueryCollection {
            compiled: Mutex::new(compiled),
            sources,
            output,
            listener_ids: Mutex::new(Vec::new()),
        });
        lq.preload()?;
        Ok(lq)
    }

    pub fn output(&self) -> Arc<Collection> {
        self.output.clone()
    }

    /// Recorded `order_by` that a `limit` did not consume into an in-graph
    /// Top-K (§4.7 step 7): the caller sorts a snapshot by this rather than
    /// the dataflow enforcing it.
    pub fn order_by(&self) -> Vec<OrderByClause> {
        self.compiled.lock().unwrap().order_by.clone()
    }

    fn preload(self: &Arc<Self>) -> Result<(), D2Error> {
        let messages = {
            let mut compiled = self.compiled.lock().unwrap();
            let aliases: Vec<String> = compiled.input_edges.keys().cloned().collect();
            for alias in &aliases {
                let Some(collection) = self.sources.get(alias) else { continue };
                let edge = *compiled.input_edges.get(alias).unwrap();
                let changes = collection.current_state_as_changes();
                push_changes(&mut compiled.graph, edge, alias, &changes);
            }
            compiled.graph.run();
            let output = compiled.output;
            compiled.graph.drain_output(output)
        };
        self.apply_output(messages)?;
        self.subscribe_sources();
        Ok(())
    }

    fn subscribe_sources(self: &Arc<Self>) {
        let aliases: Vec<String> = self.compiled.lock().unwrap().input_edges.keys().cloned().collect();
        for alias in aliases {
            let Some(collection) = self.sources.get(&alias) else { continue };
            let weak = Arc::downgrade(self);
            let alias_owned = alias.clone();
            let id = collection.subscribe_changes(Arc::new(move |changes: &[ChangeMessage]| {
                if let Some(lq) = weak.upgrade() {
                    let _ = lq.on_source_change(&alias_owned, changes);
                }
            }));
            self.listener_ids.lock().unwrap().push((alias, id));
        }
    }

    fn on_source_change(&self, alias: &str, changes: &[ChangeMessage]) -> Result<(), D2Error> {
        let messages = {
            let mut compiled = self.compiled.lock().unwrap();
            let edge = *compiled
                .input_edges
                .get(alias)
                .ok_or_else(|| D2Error::QueryShapeError(format!("unknown source alias `{alias}`")))?;
            push_changes(&mut compiled.graph, edge, alias, changes);
            compiled.graph.run();
            let output = compiled.output;
            compiled.graph.drain_output(output)
        };
        self.apply_output(messages)
    }

    fn apply_output(&self, messages: Vec<ChangeMessage>) -> Result<(), D2Error> {
        if messages.is_empty() {
            self.output.mark_ready();
            return Ok(());
        }
        self.output.begin_sync()?;
        self.output.write(messages)?;
        self.output.commit()?;
        self.output.mark_ready();
        Ok(())
    }

    /// Unsubscribes from every source and releases this query's result
    /// state (§4.9).
    pub fn destroy(&self) {
        let ids = std::mem::take(&mut *self.listener_ids.lock().unwrap());
        for (alias, id) in ids {
            if let Some(collection) = self.sources.get(&alias) {
                collection.unsubscribe(id);
            }
        }
        self.output.cleanup();
    }
}

fn push_changes(graph: &mut Graph, edge: EdgeId, alias: &str, changes: &[ChangeMessage]) {
    let mut batch = Multiset::new();
    for change in changes {
        match change {
            ChangeMessage::Insert { key, value } => batch.push(compiler::wrap_tuple(alias, key.clone(), value), 1),
            ChangeMessage::Update { key, value, previous_value } => {
                batch.push(compiler::wrap_tuple(alias, key.clone(), previous_value), -1);
                batch.push(compiler::wrap_tuple(alias, key.clone(), value), 1);
            }
            ChangeMessage::Delete { key, value } => batch.push(compiler::wrap_tuple(alias, key.clone(), value), -1),
        }
    }
    graph.push_input(edge, batch);
}

/// Key extractor for a live query's own result collection: prefers an `id`
/// field in the projected row (the common case once `select` names one),
/// falling back to a structural hash of the whole row so a query with no
/// `id` field still gets a stable key per distinct output row.
fn synthetic_get_key() -> GetKey {
    Arc::new(|row: &Row| {
        row.get("id")
            .and_then(Value::as_key)
            .unwrap_or_else(|| Key::String(format!("#{:016x}", crate::hash::hash(&row.0).unwrap_or(0))))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionOptions;
    use crate::ir::{CollectionRef, Expr, FromClause, PropRef, SelectField};

    fn user_row(id: i64, name: &str) -> Row {
        Row::new(Value::Object(vec![("id".into(), Value::Number(id as f64)), ("name".into(), Value::String(name.into()))]))
    }

    fn user_get_key() -> GetKey {
        Arc::new(|r: &Row| Key::Int(r.get("id").and_then(Value::as_f64).unwrap() as i64))
    }

    #[test]
    fn preload_reflects_existing_rows_then_follows_updates() {
        let users = Collection::new(CollectionOptions::new(user_get_key()));
        users.insert(user_row(1, "Alice"));

        let query = QueryIr {
            from: FromClause::Collection(CollectionRef { collection: "users".into(), alias: "u".into() }),
            joins: vec![],
            r#where: None,
            group_by: vec![],
            having: None,
            select: vec![
                SelectField { alias: "id".into(), expression: Expr::Ref(PropRef::new("u", ["id"])) },
                SelectField { alias: "name".into(), expression: Expr::Ref(PropRef::new("u", ["name"])) },
            ],
            order_by: vec![],
            limit: None,
            offset: None,
            distinct: false,
        };
        let mut sources = FnvHashMap::default();
        sources.insert("u".to_string(), users.clone());

        let lq = LiveQueryCollection::new(&query, sources).unwrap();
        assert_eq!(lq.output().size(), 1);

        users.insert(user_row(2, "Bob"));
        assert_eq!(lq.output().size(), 2);

        lq.destroy();
        users.insert(user_row(3, "Carol"));
        assert_eq!(lq.output().size(), 2);
    }
}
