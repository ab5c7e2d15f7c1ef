//! Declarative per-entity mapping between Halo records and stored rows.
//!
//! Each entity type is one static [`EntitySpec`]. The generic synchronizer
//! reads everything entity-specific (endpoint, response shape, lookup key,
//! fields, relations, validators, extra passes, children) from it.

use chrono::{DateTime, Duration, Utc};
use halo_client::Conditions;
use halo_core::{EntityRow, LookupKey, OnDelete, RemoteRecord, Scope};
use halo_store::{RecordStore, StoreError};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

mod entities;
mod fields;

pub use entities::*;
pub use fields::{format_timestamp, parse_halo_date, parse_key, parse_timestamp, transcode, FieldKind};

pub const CRATE_NAME: &str = "halo-records";

/// Format Halo expects for date filters such as `lastupdatefromdate`.
pub const HALO_FILTER_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn format_filter_time(at: DateTime<Utc>) -> String {
    at.format(HALO_FILTER_FORMAT).to_string()
}

/// A record that cannot be reconciled. Logged and skipped, never fatal.
#[derive(Debug, Error, PartialEq)]
pub enum InvalidRecord {
    #[error("record has no usable lookup key {field}")]
    MissingKey { field: &'static str },
    #[error("required field {field} is missing")]
    MissingField { field: &'static str },
    #[error("field {field} is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error("required relation {relation} resolved to null (remote value {remote:?})")]
    RequiredRelation {
        relation: &'static str,
        remote: Option<LookupKey>,
    },
    #[error("response is not a list of records: {0}")]
    Shape(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error(transparent)]
    Invalid(#[from] InvalidRecord),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for MapError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Constraint(message) => Self::Invalid(InvalidRecord::Constraint(message)),
            other => Self::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub local: &'static str,
    pub remote: &'static str,
    /// Tried when `remote` is absent or null, or empty for typed kinds.
    pub fallback: Option<&'static str>,
    pub kind: FieldKind,
    /// Keep the stored value when the remote sends nothing.
    pub keep_when_absent: bool,
}

impl FieldSpec {
    pub const fn new(local: &'static str, remote: &'static str, kind: FieldKind) -> Self {
        Self {
            local,
            remote,
            fallback: None,
            kind,
            keep_when_absent: false,
        }
    }

    pub const fn or_remote(mut self, fallback: &'static str) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub const fn keep_when_absent(mut self) -> Self {
        self.keep_when_absent = true;
        self
    }

    fn raw<'r>(&self, record: &'r RemoteRecord) -> Option<&'r JsonValue> {
        let blank_is_absent = self.kind.blank_is_absent();
        let present = |key: &str| {
            record.get(key).filter(|value| match value {
                JsonValue::Null => false,
                JsonValue::String(text) => !(blank_is_absent && text.is_empty()),
                _ => true,
            })
        };
        present(self.remote).or_else(|| self.fallback.and_then(present))
    }
}

pub const fn text(local: &'static str, remote: &'static str) -> FieldSpec {
    FieldSpec::new(local, remote, FieldKind::Text)
}

pub const fn integer(local: &'static str, remote: &'static str) -> FieldSpec {
    FieldSpec::new(local, remote, FieldKind::Integer)
}

pub const fn float(local: &'static str, remote: &'static str) -> FieldSpec {
    FieldSpec::new(local, remote, FieldKind::Float)
}

pub const fn flag(local: &'static str, remote: &'static str) -> FieldSpec {
    FieldSpec::new(local, remote, FieldKind::Flag)
}

pub const fn halo_date(local: &'static str, remote: &'static str) -> FieldSpec {
    FieldSpec::new(local, remote, FieldKind::HaloDate)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationSpec {
    /// Relation name on the local row.
    pub name: &'static str,
    pub remote: &'static str,
    pub target: &'static str,
    pub nullable: bool,
    /// Remote value meaning "no relation", e.g. Halo's unassigned agent.
    pub sentinel: Option<LookupKey>,
    pub on_delete: OnDelete,
    /// Target field matched against the remote value, when Halo sends a
    /// name instead of an id.
    pub match_field: Option<&'static str>,
}

impl RelationSpec {
    /// Optional lookup, cleared when the target is deleted.
    pub const fn lookup(name: &'static str, remote: &'static str, target: &'static str) -> Self {
        Self {
            name,
            remote,
            target,
            nullable: true,
            sentinel: None,
            on_delete: OnDelete::SetNull,
            match_field: None,
        }
    }

    /// Required lookup; the target cannot be deleted while referenced.
    pub const fn required(name: &'static str, remote: &'static str, target: &'static str) -> Self {
        Self {
            name,
            remote,
            target,
            nullable: false,
            sentinel: None,
            on_delete: OnDelete::Restrict,
            match_field: None,
        }
    }

    /// Owning parent; the row goes away with it.
    pub const fn owner(name: &'static str, remote: &'static str, target: &'static str) -> Self {
        Self {
            name,
            remote,
            target,
            nullable: false,
            sentinel: None,
            on_delete: OnDelete::Cascade,
            match_field: None,
        }
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub const fn with_sentinel(mut self, sentinel: LookupKey) -> Self {
        self.sentinel = Some(sentinel);
        self
    }

    pub const fn by_field(mut self, field: &'static str) -> Self {
        self.match_field = Some(field);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStrategy {
    Field(&'static str),
    /// Decimal concatenation of two remote ids, for ids unique only within a
    /// parent: ticket 12, action 3 becomes 123.
    Composite(&'static str, &'static str),
}

impl LookupStrategy {
    pub fn key_of(&self, record: &RemoteRecord) -> Result<LookupKey, InvalidRecord> {
        match *self {
            Self::Field(field) => record
                .get(field)
                .and_then(parse_key)
                .ok_or(InvalidRecord::MissingKey { field }),
            Self::Composite(outer, inner) => {
                let part = |field: &'static str| {
                    record
                        .get(field)
                        .and_then(parse_key)
                        .ok_or(InvalidRecord::MissingKey { field })
                };
                let (outer_key, inner_key) = (part(outer)?, part(inner)?);
                format!("{outer_key}{inner_key}")
                    .parse()
                    .map_err(|_| InvalidRecord::MissingKey { field: inner })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageShape {
    /// The response body is the list.
    Root,
    /// The list sits under this key.
    Key(&'static str),
}

impl PageShape {
    pub fn unpack(&self, body: JsonValue) -> Result<Vec<RemoteRecord>, InvalidRecord> {
        let list = match (self, body) {
            (_, JsonValue::Null) => return Ok(Vec::new()),
            (Self::Root, JsonValue::Array(items)) => items,
            (Self::Key(key), JsonValue::Object(mut map)) => match map.remove(*key) {
                Some(JsonValue::Array(items)) => items,
                None | Some(JsonValue::Null) => return Ok(Vec::new()),
                Some(other) => return Err(InvalidRecord::Shape(format!("{key} holds {other}"))),
            },
            // An exhausted endpoint sometimes answers with a bare empty list.
            (Self::Key(_), JsonValue::Array(items)) if items.is_empty() => items,
            (_, other) => return Err(InvalidRecord::Shape(truncate(other.to_string()))),
        };
        list.into_iter()
            .map(|item| match item {
                JsonValue::Object(record) => Ok(record),
                other => Err(InvalidRecord::Shape(truncate(other.to_string()))),
            })
            .collect()
    }
}

fn truncate(mut text: String) -> String {
    if text.len() > 120 {
        let mut cut = 120;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    Paged,
    /// One unpaged request per parent row, filtered by `param`.
    PerParent {
        parent: &'static str,
        param: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub create: bool,
    pub update: bool,
    pub delete: bool,
}

impl Capabilities {
    pub const READ_ONLY: Self = Self {
        create: false,
        update: false,
        delete: false,
    };
    pub const ALL: Self = Self {
        create: true,
        update: true,
        delete: true,
    };
    pub const CREATE_UPDATE: Self = Self {
        create: true,
        update: true,
        delete: false,
    };
}

/// Child entity refreshed after its parent is reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildLink {
    pub entity: &'static str,
    /// Condition naming the parent on the child's endpoint.
    pub remote_param: &'static str,
    /// Relation on the child row that points at the parent.
    pub relation: &'static str,
}

impl ChildLink {
    pub fn scope(&self, parent: LookupKey) -> Scope {
        Scope::related(self.relation, parent)
    }
}

/// Clock and retention settings visible to validators and extra passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapContext {
    pub now: DateTime<Utc>,
    pub keep_closed_days: i64,
}

impl MapContext {
    pub fn new(now: DateTime<Utc>, keep_closed_days: i64) -> Self {
        Self {
            now,
            keep_closed_days,
        }
    }

    pub fn closed_cutoff(&self) -> DateTime<Utc> {
        self.now - Duration::days(self.keep_closed_days)
    }
}

pub type Validator = fn(&RemoteRecord, &MapContext) -> bool;
/// Conditions for a second fetch pass in full mode.
pub type PostFetch = fn(&Conditions, &MapContext) -> Conditions;
pub type FinishRow = fn(&RemoteRecord, &mut EntityRow);
/// Checks and completes an outbound create payload.
pub type PreparePayload = fn(&mut RemoteRecord) -> Result<(), InvalidRecord>;

/// Parent whose children are refreshed after a create, named by a payload
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentRefresh {
    pub entity: &'static str,
    pub field: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct EntitySpec {
    pub name: &'static str,
    /// Name recorded on ledger entries.
    pub synchronizer: &'static str,
    pub endpoint: &'static str,
    pub page_shape: PageShape,
    pub lookup: LookupStrategy,
    pub fetch: FetchStrategy,
    pub conditions: &'static [(&'static str, &'static str)],
    pub watermark_param: Option<&'static str>,
    pub bulk_prune: bool,
    pub capabilities: Capabilities,
    pub fields: &'static [FieldSpec],
    pub relations: &'static [RelationSpec],
    pub validator: Option<Validator>,
    pub post_fetch: Option<PostFetch>,
    pub finish_row: Option<FinishRow>,
    pub children: &'static [ChildLink],
    /// Writes name the acting agent by the linked user's login name.
    pub impersonate_agent: bool,
    /// False for write-only endpoints that have no local rows.
    pub stored: bool,
    pub prepare: Option<PreparePayload>,
    pub refresh_after_create: Option<ParentRefresh>,
}

impl EntitySpec {
    pub const fn base(name: &'static str, synchronizer: &'static str, endpoint: &'static str) -> Self {
        Self {
            name,
            synchronizer,
            endpoint,
            page_shape: PageShape::Root,
            lookup: LookupStrategy::Field("id"),
            fetch: FetchStrategy::Paged,
            conditions: &[],
            watermark_param: None,
            bulk_prune: true,
            capabilities: Capabilities::READ_ONLY,
            fields: &[],
            relations: &[],
            validator: None,
            post_fetch: None,
            finish_row: None,
            children: &[],
            impersonate_agent: false,
            stored: true,
            prepare: None,
            refresh_after_create: None,
        }
    }

    pub fn base_conditions(&self) -> Conditions {
        self.conditions
            .iter()
            .fold(Conditions::new(), |conditions, (key, value)| conditions.with(*key, value))
    }

    pub fn accepts(&self, record: &RemoteRecord, ctx: &MapContext) -> bool {
        self.validator.is_none_or(|validate| validate(record, ctx))
    }

    pub fn relation(&self, name: &str) -> Option<&RelationSpec> {
        self.relations.iter().find(|relation| relation.name == name)
    }

    /// Build the row for `record` from plain fields only. Relations are
    /// filled in by [`resolve_relations`].
    pub fn apply_record(
        &self,
        record: &RemoteRecord,
        existing: Option<&EntityRow>,
    ) -> Result<EntityRow, InvalidRecord> {
        let key = self.lookup.key_of(record)?;
        let mut row = EntityRow::new(key);
        for field in self.fields {
            let raw = field.raw(record);
            if raw.is_none() && field.keep_when_absent {
                if let Some(previous) = existing.and_then(|row| row.fields.get(field.local)) {
                    row.set_field(field.local, previous.clone());
                    continue;
                }
            }
            let value = transcode(field.kind, raw).map_err(|reason| InvalidRecord::Malformed {
                field: field.remote,
                reason,
            })?;
            row.set_field(field.local, value);
        }
        if let Some(finish) = self.finish_row {
            finish(record, &mut row);
        }
        Ok(row)
    }

    /// Resolve every declared relation of `record` onto `row`.
    ///
    /// Absent, null and sentinel values become null. A value that points at
    /// no stored row is logged and becomes null. Null on a required relation
    /// rejects the record.
    pub async fn resolve_relations(
        &self,
        record: &RemoteRecord,
        row: &mut EntityRow,
        store: &dyn RecordStore,
    ) -> Result<(), MapError> {
        for relation in self.relations {
            let (remote, resolved) = match relation.match_field {
                Some(field) => (None, self.match_by_field(relation, field, record, row, store).await?),
                None => self.match_by_key(relation, record, row, store).await?,
            };

            if resolved.is_none() && !relation.nullable {
                return Err(InvalidRecord::RequiredRelation {
                    relation: relation.name,
                    remote,
                }
                .into());
            }
            row.set_relation(relation.name, relation.target, resolved, relation.on_delete);
        }
        Ok(())
    }

    async fn match_by_key(
        &self,
        relation: &RelationSpec,
        record: &RemoteRecord,
        row: &EntityRow,
        store: &dyn RecordStore,
    ) -> Result<(Option<LookupKey>, Option<LookupKey>), MapError> {
        let remote = match record.get(relation.remote) {
            None | Some(JsonValue::Null) => None,
            Some(value) => Some(parse_key(value).ok_or_else(|| InvalidRecord::Malformed {
                field: relation.remote,
                reason: format!("expected an id, got {value}"),
            })?),
        };
        let resolved = match remote.filter(|key| Some(*key) != relation.sentinel) {
            Some(key) if relation.target == self.name && key == row.key => Some(key),
            Some(key) if store.exists(relation.target, key).await? => Some(key),
            Some(key) => {
                self.warn_missing(relation, row, &JsonValue::from(key));
                None
            }
            None => None,
        };
        Ok((remote, resolved))
    }

    async fn match_by_field(
        &self,
        relation: &RelationSpec,
        field: &'static str,
        record: &RemoteRecord,
        row: &EntityRow,
        store: &dyn RecordStore,
    ) -> Result<Option<LookupKey>, MapError> {
        let value = match record.get(relation.remote) {
            None | Some(JsonValue::Null) => return Ok(None),
            Some(JsonValue::String(text)) if text.trim().is_empty() => return Ok(None),
            Some(value) => value,
        };
        let found = store.find_by_field(relation.target, field, value).await?;
        if found.is_none() {
            self.warn_missing(relation, row, value);
        }
        Ok(found)
    }

    fn warn_missing(&self, relation: &RelationSpec, row: &EntityRow, missing: &JsonValue) {
        warn!(
            entity = self.name,
            key = row.key,
            relation = relation.name,
            target = relation.target,
            %missing,
            "related row not found, leaving relation empty"
        );
    }

    /// Rewrite an outbound create payload before it is sent to Halo.
    pub async fn prepare_payload(
        &self,
        mut payload: JsonValue,
        store: &dyn RecordStore,
    ) -> Result<JsonValue, MapError> {
        if let Some(prepare) = self.prepare {
            match &mut payload {
                JsonValue::Object(map) => prepare(map)?,
                other => return Err(InvalidRecord::Shape(format!("payload is {other}")).into()),
            }
        }
        if !self.impersonate_agent {
            return Ok(payload);
        }
        let Some(agent) = payload.get("agent").and_then(parse_key) else {
            return Ok(payload);
        };
        let users = store
            .keys(HALO_USER.name, &Scope::related("agent", agent))
            .await?;
        let mut login = None;
        for user in users {
            login = store
                .get(HALO_USER.name, user)
                .await?
                .and_then(|row| row.field("name").and_then(JsonValue::as_str).map(str::to_string));
            if login.is_some() {
                break;
            }
        }
        let login = login.ok_or(InvalidRecord::RequiredRelation {
            relation: "agent",
            remote: Some(agent),
        })?;
        if let JsonValue::Object(map) = &mut payload {
            map.insert("agent".to_string(), JsonValue::String(login));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use halo_store::MemoryStore;
    use serde_json::json;

    fn record(value: JsonValue) -> RemoteRecord {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    #[test]
    fn composite_keys_concatenate_decimal_ids() {
        let key = ACTION
            .lookup
            .key_of(&record(json!({"ticket_id": 12, "id": 3})))
            .unwrap();
        assert_eq!(key, 123);
        let err = ACTION.lookup.key_of(&record(json!({"id": 3}))).unwrap_err();
        assert_eq!(err, InvalidRecord::MissingKey { field: "ticket_id" });
        assert_eq!(
            PRIORITY.lookup.key_of(&record(json!({"priorityid": 4, "id": "x"}))).unwrap(),
            4
        );
    }

    #[test]
    fn page_shapes_unpack_root_and_keyed_lists() {
        let rows = PageShape::Key("tickets")
            .unpack(json!({"tickets": [{"id": 1}, {"id": 2}], "record_count": 2}))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(PageShape::Key("tickets").unpack(json!({})).unwrap().is_empty());
        assert!(PageShape::Key("tickets").unpack(json!([])).unwrap().is_empty());
        assert_eq!(PageShape::Root.unpack(json!([{"id": 9}])).unwrap()[0]["id"], 9);
        assert!(PageShape::Root.unpack(json!({"id": 9})).is_err());
        assert!(PageShape::Root.unpack(json!([1, 2])).is_err());
    }

    #[test]
    fn fallback_and_kept_fields() {
        let existing = EntityRow::new(5).with_field("user_email", json!("old@example.com"));
        let row = TICKET
            .apply_record(
                &record(json!({"id": 5, "last_update": "2026-01-02T03:04:05Z", "summary": "s"})),
                Some(&existing),
            )
            .unwrap();
        assert_eq!(row.field("last_update"), Some(&json!("2026-01-02T03:04:05Z")));
        assert_eq!(row.field("user_email"), Some(&json!("old@example.com")));
        assert_eq!(row.field("flagged"), Some(&json!(false)));

        let err = TICKET
            .apply_record(&record(json!({"id": 5, "lastactiondate": "soon"})), None)
            .unwrap_err();
        assert!(matches!(err, InvalidRecord::Malformed { field: "lastactiondate", .. }));
    }

    #[test]
    fn empty_text_is_kept_but_empty_dates_are_absent() {
        let existing = EntityRow::new(5)
            .with_field("user_email", json!("old@example.com"))
            .with_field("date_closed", json!("2026-01-01T00:00:00Z"));
        let row = TICKET
            .apply_record(
                &record(json!({
                    "id": 5,
                    "summary": "",
                    "useremail": "",
                    "dateclosed": "",
                    "impact": "",
                })),
                Some(&existing),
            )
            .unwrap();
        assert_eq!(row.field("summary"), Some(&json!("")));
        assert_eq!(row.field("user_email"), Some(&json!("")));
        assert_eq!(row.field("date_closed"), Some(&json!("2026-01-01T00:00:00Z")));
        assert_eq!(row.field("impact"), None);
    }

    #[tokio::test]
    async fn relations_resolve_to_null_when_missing_or_sentinel() {
        let store = MemoryStore::new();
        store.save("status", &EntityRow::new(2)).await.unwrap();
        store.save("agent", &EntityRow::new(8)).await.unwrap();

        let remote = record(json!({
            "id": 40,
            "status_id": 2,
            "agent_id": 1,
            "client_id": 77,
            "priority_id": "8.0",
            "parent_id": 40,
        }));
        let mut row = TICKET.apply_record(&remote, None).unwrap();
        TICKET.resolve_relations(&remote, &mut row, &store).await.unwrap();

        assert_eq!(row.relation_key("status"), Some(2));
        assert_eq!(row.relation_key("agent"), None);
        assert_eq!(row.relation_key("client"), None);
        assert_eq!(row.relation_key("priority"), None);
        assert_eq!(row.relation_key("project"), Some(40));
        assert_eq!(row.relations["status"].on_delete, OnDelete::Restrict);
    }

    #[tokio::test]
    async fn ticket_team_resolves_by_name() {
        let store = MemoryStore::new();
        store.save("status", &EntityRow::new(1)).await.unwrap();
        store
            .save("team", &EntityRow::new(4).with_field("name", json!("Service Desk")))
            .await
            .unwrap();

        let remote = record(json!({"id": 50, "status_id": 1, "team": "Service Desk"}));
        let mut row = TICKET.apply_record(&remote, None).unwrap();
        TICKET.resolve_relations(&remote, &mut row, &store).await.unwrap();
        assert_eq!(row.relation_key("team"), Some(4));
        assert_eq!(row.relations["team"].entity, "team");

        for team in [json!("Projects"), json!(""), JsonValue::Null] {
            let remote = record(json!({"id": 51, "status_id": 1, "team": team}));
            let mut row = TICKET.apply_record(&remote, None).unwrap();
            TICKET.resolve_relations(&remote, &mut row, &store).await.unwrap();
            assert_eq!(row.relation_key("team"), None);
        }
    }

    #[tokio::test]
    async fn time_entries_are_completed_before_sending() {
        let store = MemoryStore::new();
        let payload = TIMESHEET_EVENT
            .prepare_payload(
                json!({
                    "start_date": "2025-02-25T18:10:00.000Z",
                    "end_date": "2025-02-25 18:26:00",
                    "ticket_id": 2267,
                    "agent_id": "3",
                    "charge_rate": "1",
                    "note": "logged time",
                }),
                &store,
            )
            .await
            .unwrap();
        assert_eq!(payload["start_date"], "2025-02-25T18:10:00Z");
        assert_eq!(payload["end_date"], "2025-02-25T18:26:00Z");
        assert_eq!(payload["lognewticket"], false);
        assert_eq!(payload["event_type"], 0);
        assert_eq!(payload["agent_id"], "3");

        let err = TIMESHEET_EVENT
            .prepare_payload(json!({"ticket_id": 2267, "note": "x"}), &store)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MapError::Invalid(InvalidRecord::MissingField { field: "start_date" })
        ));

        let err = TIMESHEET_EVENT
            .prepare_payload(
                json!({
                    "start_date": "later",
                    "end_date": "2025-02-25T18:26:00Z",
                    "ticket_id": 1,
                    "agent_id": 3,
                    "charge_rate": 1,
                    "note": "x",
                }),
                &store,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MapError::Invalid(InvalidRecord::Malformed { field: "start_date", .. })
        ));
    }

    #[tokio::test]
    async fn missing_required_relation_rejects_record() {
        let store = MemoryStore::new();
        let remote = record(json!({"id": 41, "status_id": 99}));
        let mut row = TICKET.apply_record(&remote, None).unwrap();
        let err = TICKET
            .resolve_relations(&remote, &mut row, &store)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MapError::Invalid(InvalidRecord::RequiredRelation {
                relation: "status",
                remote: Some(99)
            })
        ));
    }

    #[test]
    fn validators_filter_statuses_and_old_closed_tickets() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap();
        let ctx = MapContext::new(now, 1);
        assert!(STATUS.accepts(&record(json!({"id": 1, "type": 0})), &ctx));
        assert!(!STATUS.accepts(&record(json!({"id": 2, "type": 1})), &ctx));

        assert!(TICKET.accepts(&record(json!({"id": 1})), &ctx));
        assert!(TICKET.accepts(&record(json!({"id": 1, "dateclosed": "1900-01-01T00:00:00"})), &ctx));
        assert!(TICKET.accepts(&record(json!({"id": 1, "dateclosed": "2026-03-10T01:00:00"})), &ctx));
        assert!(!TICKET.accepts(&record(json!({"id": 1, "dateclosed": "2026-03-08T01:00:00"})), &ctx));
    }

    #[test]
    fn closed_ticket_pass_swaps_open_filter() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap();
        let ctx = MapContext::new(now, 2);
        let pass = TICKET.post_fetch.unwrap();
        let conditions = pass(&TICKET.base_conditions(), &ctx);
        assert_eq!(conditions.get("open_only"), None);
        assert_eq!(conditions.get("closed_only"), Some("true"));
        assert_eq!(
            conditions.get("lastupdatefromdate"),
            Some("2026-03-08T12:00:00.000000Z")
        );
    }

    #[test]
    fn site_address_joins_present_lines() {
        let row = SITE
            .apply_record(
                &record(json!({
                    "id": 3,
                    "name": "HQ",
                    "delivery_address_line1": "1 Main St",
                    "delivery_address_line2": "",
                    "delivery_address_line3": "Springfield",
                })),
                None,
            )
            .unwrap();
        assert_eq!(row.field("delivery_address"), Some(&json!("1 Main St Springfield")));
    }

    #[tokio::test]
    async fn action_payload_names_agent_by_linked_user() {
        let store = MemoryStore::new();
        store.save("agent", &EntityRow::new(6)).await.unwrap();
        store
            .save(
                "halo_user",
                &EntityRow::new(60)
                    .with_field("name", json!("jdoe"))
                    .with_relation("agent", "agent", Some(6), OnDelete::SetNull),
            )
            .await
            .unwrap();

        let payload = ACTION
            .prepare_payload(json!({"ticket_id": 1, "agent": 6, "note": "hi"}), &store)
            .await
            .unwrap();
        assert_eq!(payload["agent"], "jdoe");

        let err = ACTION
            .prepare_payload(json!({"agent": 7}), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::Invalid(InvalidRecord::RequiredRelation { .. })));

        let untouched = TICKET.prepare_payload(json!({"agent": 6}), &store).await.unwrap();
        assert_eq!(untouched["agent"], 6);
    }

    #[test]
    fn registry_lists_parents_before_children() {
        let position = |name: &str| ALL_ENTITIES.iter().position(|spec| spec.name == name);
        for spec in ALL_ENTITIES {
            for relation in spec.relations {
                if relation.target != spec.name {
                    assert!(
                        position(relation.target).is_some(),
                        "{} relation {} targets unknown entity",
                        spec.name,
                        relation.name
                    );
                }
            }
        }
        assert!(position("status") < position("ticket"));
        assert!(position("ticket") < position("action"));
        assert!(position("team") < position("ticket"));
        assert_eq!(entity_spec("charge_rate").unwrap().endpoint, "Lookup?lookupid=17");
        assert!(!entity_spec("timesheet_event").unwrap().stored);
        assert!(position("timesheet_event").is_none());
        assert!(entity_spec("nope").is_none());
    }
}
