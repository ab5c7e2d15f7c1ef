use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use halo_client::{
    ApiError, ClientSettings, HaloClient, HaloCredentials, RecordedRequest, ScriptedRemotes,
    TokenFetcher, TOKEN_LOCK_NAME,
};
use halo_core::{DistributedLock, EntityRow, OnDelete, SyncCounts, SyncJob, SyncMode};
use halo_records::{
    EntitySpec, InvalidRecord, ACTION, APPOINTMENT, PRIORITY, STATUS, TEAM, TICKET,
    TIMESHEET_EVENT,
};
use halo_store::{JobLedger, MemoryStore, RecordStore};
use halo_sync::{sync_related, SyncError, SyncServices, SyncSettings};
use serde_json::{json, Value as JsonValue};

struct Harness {
    store: Arc<MemoryStore>,
    remotes: Arc<ScriptedRemotes>,
    services: SyncServices,
}

fn harness(batch_size: u32) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let remotes = Arc::new(ScriptedRemotes::new());
    let services = SyncServices::new(
        store.clone(),
        store.clone(),
        remotes.clone(),
        SyncSettings {
            batch_size,
            keep_closed_days: 1,
        },
    );
    Harness {
        store,
        remotes,
        services,
    }
}

fn counts(created: u64, updated: u64, skipped: u64, deleted: u64) -> SyncCounts {
    SyncCounts {
        created,
        updated,
        skipped,
        deleted,
    }
}

fn ticket(id: i64, summary: &str) -> JsonValue {
    json!({"id": id, "summary": summary, "status_id": 1})
}

fn ticket_page(tickets: Vec<JsonValue>) -> JsonValue {
    json!({ "tickets": tickets })
}

impl Harness {
    async fn seed_status(&self, id: i64) {
        self.store.save("status", &EntityRow::new(id)).await.unwrap();
    }

    async fn seed_ticket(&self, id: i64) {
        self.store
            .save(
                "ticket",
                &EntityRow::new(id).with_relation("status", "status", Some(1), OnDelete::Restrict),
            )
            .await
            .unwrap();
    }

    /// Tickets script with the closed-ticket pass answered by an empty page.
    fn tickets(&self) -> Arc<halo_client::ScriptedResource> {
        let script = self.remotes.script("Tickets");
        script.respond_when("closed_only", "true", ticket_page(Vec::new()));
        script
    }

    async fn sync(&self, spec: &'static EntitySpec, mode: SyncMode) -> Result<SyncCounts, SyncError> {
        self.services.synchronizer(spec, mode).sync().await
    }
}

#[tokio::test]
async fn full_sync_creates_updates_skips_and_prunes() {
    let h = harness(100);
    h.seed_status(1).await;
    let tickets = h.tickets();

    tickets.push_page(ticket_page(vec![ticket(1, "a"), ticket(2, "b"), ticket(3, "c")]));
    assert_eq!(h.sync(&TICKET, SyncMode::Full).await.unwrap(), counts(3, 0, 0, 0));

    tickets.push_page(ticket_page(vec![ticket(1, "a"), ticket(2, "b2"), ticket(4, "d")]));
    assert_eq!(h.sync(&TICKET, SyncMode::Full).await.unwrap(), counts(1, 1, 1, 1));

    assert!(h.store.get("ticket", 3).await.unwrap().is_none());
    let updated = h.store.get("ticket", 2).await.unwrap().unwrap();
    assert_eq!(updated.field("summary"), Some(&json!("b2")));
    assert_eq!(h.store.row_count("ticket"), 3);

    let jobs = h.store.jobs();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|job| job.success == Some(true)));
    assert_eq!(jobs[1].counts, counts(1, 1, 1, 1));
    assert_eq!(jobs[1].synchronizer, "TicketSynchronizer");
    assert_eq!(jobs[1].mode, SyncMode::Full);
}

#[tokio::test]
async fn repeated_full_sync_is_idempotent() {
    let h = harness(100);
    h.seed_status(1).await;
    let tickets = h.tickets();
    let page = ticket_page(vec![ticket(1, "a"), ticket(2, "b")]);

    tickets.push_page(page.clone());
    h.sync(&TICKET, SyncMode::Full).await.unwrap();
    let before = h.store.get("ticket", 2).await.unwrap();

    tickets.push_page(page);
    assert_eq!(h.sync(&TICKET, SyncMode::Full).await.unwrap(), counts(0, 0, 2, 0));
    assert_eq!(h.store.get("ticket", 2).await.unwrap(), before);
}

#[tokio::test]
async fn full_ticket_sync_fetches_recently_closed_tickets() {
    let h = harness(100);
    h.seed_status(1).await;
    let tickets = h.remotes.script("Tickets");
    tickets.respond_when("closed_only", "true", ticket_page(vec![ticket(7, "closed")]));
    tickets.push_page(ticket_page(vec![ticket(1, "open")]));

    assert_eq!(h.sync(&TICKET, SyncMode::Full).await.unwrap(), counts(2, 0, 0, 0));

    let requests = tickets.requests();
    assert_eq!(requests.len(), 2);
    let first = requests[0].conditions().unwrap();
    assert_eq!(first.get("open_only"), Some("true"));
    let closed = requests[1].conditions().unwrap();
    assert_eq!(closed.get("open_only"), None);
    assert_eq!(closed.get("closed_only"), Some("true"));
    assert!(closed.get("lastupdatefromdate").is_some());
}

#[tokio::test]
async fn incremental_sync_never_deletes() {
    let h = harness(100);
    h.seed_status(1).await;
    for id in [1, 2, 3] {
        h.seed_ticket(id).await;
    }
    let tickets = h.tickets();
    tickets.push_page(ticket_page(vec![ticket(1, "a")]));

    let result = h.sync(&TICKET, SyncMode::Incremental).await.unwrap();
    assert_eq!(result, counts(0, 1, 0, 0));
    assert_eq!(h.store.row_count("ticket"), 3);
    // No closed-ticket pass outside full mode.
    assert_eq!(tickets.read_count(), 1);
    assert_eq!(h.store.jobs()[0].mode, SyncMode::Incremental);
}

async fn seed_successful_run(store: &MemoryStore, started_at: chrono::DateTime<Utc>) {
    let mut job = SyncJob::start("ticket", "TicketSynchronizer", SyncMode::Incremental, started_at);
    job.finish(SyncCounts::default(), None, started_at);
    store.finish(&job).await.unwrap();
}

#[tokio::test]
async fn watermark_uses_most_recent_of_two_successful_runs() {
    let h = harness(100);
    let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
    let t2 = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().unwrap();
    seed_successful_run(&h.store, t2).await;
    seed_successful_run(&h.store, t1).await;
    let tickets = h.tickets();

    h.sync(&TICKET, SyncMode::Incremental).await.unwrap();

    let requests = tickets.requests();
    let conditions = requests[0].conditions().unwrap();
    assert_eq!(
        conditions.get("lastupdatefromdate"),
        Some("2026-01-02T03:04:05.000000Z")
    );
}

#[tokio::test]
async fn watermark_needs_more_than_one_successful_run() {
    let h = harness(100);
    seed_successful_run(&h.store, Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).single().unwrap()).await;
    let mut failed = SyncJob::start("ticket", "TicketSynchronizer", SyncMode::Incremental, Utc::now());
    failed.finish(SyncCounts::default(), Some("boom".to_string()), Utc::now());
    h.store.finish(&failed).await.unwrap();
    let tickets = h.tickets();

    h.sync(&TICKET, SyncMode::Incremental).await.unwrap();
    assert_eq!(
        tickets.requests()[0].conditions().unwrap().get("lastupdatefromdate"),
        None
    );
    assert_eq!(
        h.services.synchronizer(&TICKET, SyncMode::Incremental).watermark().await.unwrap(),
        None
    );
}

#[tokio::test]
async fn repeated_page_stops_paging() {
    let h = harness(2);
    let priorities = h.remotes.script("Priority");
    let page = json!([{"priorityid": 1, "name": "High"}, {"priorityid": 2, "name": "Low"}]);
    priorities
        .push_page(page.clone())
        .push_page(page)
        .push_page(json!([{"priorityid": 3}]));

    assert_eq!(h.sync(&PRIORITY, SyncMode::Full).await.unwrap(), counts(2, 0, 0, 0));
    assert_eq!(priorities.read_count(), 2);
    assert_eq!(h.store.row_count("priority"), 2);
}

#[tokio::test]
async fn short_page_ends_paging() {
    let h = harness(2);
    let priorities = h.remotes.script("Priority");
    priorities
        .push_page(json!([{"priorityid": 1}, {"priorityid": 2}]))
        .push_page(json!([{"priorityid": 3}]))
        .push_page(json!([{"priorityid": 4}]));

    assert_eq!(h.sync(&PRIORITY, SyncMode::Full).await.unwrap(), counts(3, 0, 0, 0));
    match &priorities.requests()[1] {
        RecordedRequest::FetchPage { page, batch_size, .. } => {
            assert_eq!((*page, *batch_size), (2, 2));
        }
        other => panic!("unexpected request {other:?}"),
    }
    assert_eq!(priorities.read_count(), 2);
}

#[tokio::test]
async fn dangling_relations_are_nulled_or_reject_the_record() {
    let h = harness(100);
    h.seed_status(1).await;
    let tickets = h.tickets();

    tickets.push_page(ticket_page(vec![
        json!({"id": 5, "status_id": 1, "agent_id": 99}),
        json!({"id": 6, "status_id": 1}),
    ]));
    assert_eq!(h.sync(&TICKET, SyncMode::Full).await.unwrap(), counts(2, 0, 0, 0));
    let five = h.store.get("ticket", 5).await.unwrap().unwrap();
    assert_eq!(five.relation_key("agent"), None);

    // Ticket 6 now names a status that does not exist locally: it is
    // skipped without counting, but still counts as seen.
    tickets.push_page(ticket_page(vec![
        json!({"id": 5, "status_id": 1, "agent_id": 99}),
        json!({"id": 6, "status_id": 42}),
    ]));
    assert_eq!(h.sync(&TICKET, SyncMode::Full).await.unwrap(), counts(0, 0, 1, 0));
    let six = h.store.get("ticket", 6).await.unwrap().unwrap();
    assert_eq!(six.relation_key("status"), Some(1));
}

#[tokio::test]
async fn malformed_and_keyless_records_are_skipped() {
    let h = harness(100);
    h.seed_status(1).await;
    let tickets = h.tickets();
    tickets.push_page(ticket_page(vec![
        json!({"summary": "no id", "status_id": 1}),
        json!({"id": 8, "status_id": 1, "lastactiondate": "not a date"}),
        ticket(9, "fine"),
    ]));

    assert_eq!(h.sync(&TICKET, SyncMode::Full).await.unwrap(), counts(1, 0, 0, 0));
    assert_eq!(h.store.row_count("ticket"), 1);
}

#[tokio::test]
async fn failed_run_is_recorded_with_partial_counts() {
    let h = harness(2);
    h.remotes
        .script("Priority")
        .push_page(json!([{"priorityid": 1}, {"priorityid": 2}]))
        .push_error(ApiError::Server {
            status: 500,
            message: "An unknown error has occurred.".to_string(),
        });

    let err = h.sync(&PRIORITY, SyncMode::Full).await.unwrap_err();
    assert!(matches!(err, SyncError::Api(ApiError::Server { status: 500, .. })));

    let jobs = h.store.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].success, Some(false));
    assert_eq!(jobs[0].counts, counts(2, 0, 0, 0));
    assert!(jobs[0].message.as_deref().unwrap_or_default().contains("500"));
    assert!(jobs[0].is_finished());
    // Rows saved before the failure stay.
    assert_eq!(h.store.row_count("priority"), 2);
}

#[tokio::test]
async fn lock_failure_mid_run_keeps_partial_counts() {
    let h = harness(2);
    h.remotes
        .script("Priority")
        .push_page(json!([{"priorityid": 1}, {"priorityid": 2}]))
        .push_error(ApiError::LockNotAcquired("halo_token_lock held elsewhere".to_string()));

    let err = h.sync(&PRIORITY, SyncMode::Full).await.unwrap_err();
    assert!(matches!(err, SyncError::Api(ApiError::LockNotAcquired(_))));

    let job = h.store.jobs().pop().unwrap();
    assert_eq!(job.success, Some(false));
    assert_eq!(job.counts, counts(2, 0, 0, 0));
    assert!(job.message.as_deref().unwrap_or_default().contains("token lock"));
    assert_eq!(h.store.row_count("priority"), 2);
}

#[tokio::test]
async fn held_token_lock_fails_the_run_through_the_client() {
    let store = Arc::new(MemoryStore::new());
    let _held = store
        .acquire(TOKEN_LOCK_NAME, Duration::from_secs(600), Duration::ZERO)
        .await
        .unwrap();
    let tokens = TokenFetcher::new(
        HaloCredentials::new("http://127.0.0.1:9", "id", "secret"),
        store.clone(),
    )
    .unwrap()
    .with_lock(store.clone());
    let client = HaloClient::new("http://127.0.0.1:9", tokens, ClientSettings::default()).unwrap();
    let services = SyncServices::new(
        store.clone(),
        store.clone(),
        Arc::new(client),
        SyncSettings::default(),
    );

    tokio::time::pause();
    let err = services
        .synchronizer(&PRIORITY, SyncMode::Full)
        .sync()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Api(ApiError::LockNotAcquired(_))));

    let jobs = store.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].success, Some(false));
    assert_eq!(jobs[0].counts, counts(0, 0, 0, 0));
    assert!(jobs[0].is_finished());
}

#[tokio::test]
async fn overflowing_composite_key_skips_only_that_action() {
    let h = harness(100);
    h.seed_status(1).await;
    h.seed_ticket(10).await;
    h.remotes.script("Actions").respond_when(
        "ticket_id",
        10,
        json!({"actions": [
            {"id": i64::MAX, "ticket_id": 10},
            {"id": 1, "ticket_id": 10},
        ]}),
    );

    let overflow = ACTION
        .lookup
        .key_of(json!({"id": i64::MAX, "ticket_id": 10}).as_object().unwrap());
    assert_eq!(overflow, Err(InvalidRecord::MissingKey { field: "id" }));

    assert_eq!(h.sync(&ACTION, SyncMode::Full).await.unwrap(), counts(1, 0, 0, 0));
    assert_eq!(h.store.row_count("action"), 1);
    assert!(h.store.get("action", 101).await.unwrap().is_some());
}

async fn statuses_with_referenced_second(h: &Harness) {
    h.remotes.script("Status").push_page(json!([
        {"id": 1, "name": "New", "type": 0},
        {"id": 2, "name": "Open", "type": 0},
        {"id": 3, "name": "Hold", "type": 0},
    ]));
    assert_eq!(h.sync(&STATUS, SyncMode::Full).await.unwrap(), counts(3, 0, 0, 0));
    h.store
        .save(
            "ticket",
            &EntityRow::new(9).with_relation("status", "status", Some(2), OnDelete::Restrict),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn iterative_prune_skips_referenced_rows() {
    let h = harness(100);
    statuses_with_referenced_second(&h).await;

    // The remote now returns nothing at all.
    assert_eq!(h.sync(&STATUS, SyncMode::Full).await.unwrap(), counts(0, 0, 0, 2));
    assert!(h.store.get("status", 2).await.unwrap().is_some());
    assert_eq!(h.store.row_count("status"), 1);
}

#[tokio::test]
async fn bulk_prune_refused_by_integrity_deletes_nothing() {
    let h = harness(100);
    statuses_with_referenced_second(&h).await;
    let bulk: &'static EntitySpec = Box::leak(Box::new(EntitySpec {
        bulk_prune: true,
        ..STATUS
    }));

    assert_eq!(h.sync(bulk, SyncMode::Full).await.unwrap(), counts(0, 0, 0, 0));
    assert_eq!(h.store.row_count("status"), 3);
    assert_eq!(h.store.jobs().last().unwrap().success, Some(true));
}

#[tokio::test]
async fn rejected_records_are_invisible() {
    let h = harness(100);
    h.seed_status(2).await;
    h.remotes.script("Status").push_page(json!([
        {"id": 1, "type": 0},
        {"id": 2, "type": 1},
    ]));

    // Status 2 is not a ticket status: not counted, and pruned as unseen.
    assert_eq!(h.sync(&STATUS, SyncMode::Full).await.unwrap(), counts(1, 0, 0, 1));
    assert!(h.store.get("status", 2).await.unwrap().is_none());
}

#[tokio::test]
async fn per_parent_fetch_queries_each_ticket() {
    let h = harness(100);
    h.seed_status(1).await;
    h.seed_ticket(10).await;
    h.seed_ticket(11).await;
    let actions = h.remotes.script("Actions");
    actions
        .respond_when("ticket_id", 10, json!({"actions": [{"id": 1, "ticket_id": 10}, {"id": 2, "ticket_id": 10}]}))
        .respond_when("ticket_id", 11, json!({"actions": [{"id": 1, "ticket_id": 11}]}));

    assert_eq!(h.sync(&ACTION, SyncMode::Full).await.unwrap(), counts(3, 0, 0, 0));
    for key in [101, 102, 111] {
        assert!(h.store.get("action", key).await.unwrap().is_some(), "missing action {key}");
    }
    assert!(actions
        .requests()
        .iter()
        .all(|request| matches!(request, RecordedRequest::FetchAll { .. })));
}

#[tokio::test]
async fn related_sync_prunes_only_within_parent() {
    let h = harness(100);
    h.seed_status(1).await;
    h.seed_ticket(10).await;
    h.seed_ticket(11).await;
    for (key, parent) in [(100, 10), (101, 10), (200, 11)] {
        h.store
            .save(
                "appointment",
                &EntityRow::new(key).with_relation("ticket", "ticket", Some(parent), OnDelete::Cascade),
            )
            .await
            .unwrap();
    }
    let appointments = h.remotes.script("Appointment");
    appointments.respond_when(
        "ticket_id",
        10,
        json!([{"id": 100, "ticket_id": 10, "subject": "Site visit", "start_date": "2026-03-01T09:00:00"}]),
    );
    h.remotes
        .script("Actions")
        .respond_when("ticket_id", 10, json!({"actions": [{"id": 4, "ticket_id": 10, "note": "called"}]}));

    let results = sync_related(&h.services, &TICKET, 10).await.unwrap();
    assert_eq!(
        results,
        vec![
            ("appointment", counts(0, 1, 0, 1)),
            ("action", counts(1, 0, 0, 0)),
        ]
    );

    assert!(h.store.get("appointment", 100).await.unwrap().is_some());
    assert!(h.store.get("appointment", 101).await.unwrap().is_none());
    assert!(h.store.get("appointment", 200).await.unwrap().is_some());
    assert!(h.store.get("action", 104).await.unwrap().is_some());

    let request = &appointments.requests()[0];
    let conditions = request.conditions().unwrap();
    assert_eq!(conditions.get("ticket_id"), Some("10"));
    assert_eq!(conditions.get("hidecompleted"), Some("true"));
    // Cascades leave no ledger entries.
    assert!(h.store.jobs().is_empty());
}

#[tokio::test]
async fn deleting_a_ticket_cascades_to_children() {
    let h = harness(100);
    h.seed_status(1).await;
    h.seed_ticket(10).await;
    h.store
        .save(
            "appointment",
            &EntityRow::new(100).with_relation("ticket", "ticket", Some(10), OnDelete::Cascade),
        )
        .await
        .unwrap();

    h.services
        .synchronizer(&TICKET, SyncMode::Full)
        .delete(10)
        .await
        .unwrap();

    assert!(h.store.get("ticket", 10).await.unwrap().is_none());
    assert!(h.store.get("appointment", 100).await.unwrap().is_none());
    assert_eq!(
        h.remotes.script("Tickets").requests(),
        vec![RecordedRequest::Delete(10)]
    );
}

#[tokio::test]
async fn created_records_are_reconciled_locally() {
    let h = harness(100);
    h.seed_status(1).await;

    let row = h
        .services
        .synchronizer(&TICKET, SyncMode::Full)
        .create(json!({"summary": "Printer on fire", "status_id": 1}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.key, 1000);
    let stored = h.store.get("ticket", 1000).await.unwrap().unwrap();
    assert_eq!(stored.field("summary"), Some(&json!("Printer on fire")));

    let updated = h
        .services
        .synchronizer(&TICKET, SyncMode::Full)
        .update(1000, json!({"summary": "Printer fixed", "status_id": 1}))
        .await
        .unwrap();
    assert_eq!(updated.field("summary"), Some(&json!("Printer fixed")));
    assert_eq!(h.store.row_count("ticket"), 1);
}

#[tokio::test]
async fn action_writes_impersonate_the_linked_user() {
    let h = harness(100);
    h.seed_status(1).await;
    h.seed_ticket(10).await;
    h.store.save("agent", &EntityRow::new(6)).await.unwrap();
    h.store
        .save(
            "halo_user",
            &EntityRow::new(60)
                .with_field("name", json!("jdoe"))
                .with_relation("agent", "agent", Some(6), OnDelete::SetNull),
        )
        .await
        .unwrap();

    let row = h
        .services
        .synchronizer(&ACTION, SyncMode::Full)
        .create(json!({"ticket_id": 10, "agent": 6, "note": "On my way"}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.key, 101000);
    assert_eq!(row.relation_key("ticket"), Some(10));

    let sent = h.remotes.script("Actions").requests();
    match &sent[0] {
        RecordedRequest::Create(payload) => assert_eq!(payload["agent"], "jdoe"),
        other => panic!("unexpected request {other:?}"),
    }
}

#[tokio::test]
async fn unsupported_writes_are_refused() {
    let h = harness(100);
    let appointments = h.services.synchronizer(&APPOINTMENT, SyncMode::Full);
    assert!(matches!(
        appointments.create(json!({"subject": "x"})).await,
        Err(SyncError::Unsupported {
            entity: "appointment",
            operation: "create"
        })
    ));
    assert!(matches!(
        h.services.synchronizer(&ACTION, SyncMode::Full).delete(1).await,
        Err(SyncError::Unsupported { operation: "delete", .. })
    ));
    assert!(h.remotes.script("Appointment").requests().is_empty());
    assert!(h.services.synchronizer_for("widget", SyncMode::Full).is_err());
}

#[tokio::test]
async fn logged_time_refreshes_the_ticket_children() {
    let h = harness(100);
    h.seed_status(1).await;
    h.seed_ticket(10).await;
    h.remotes.script("Actions").respond_when(
        "ticket_id",
        10,
        json!({"actions": [{"id": 7, "ticket_id": 10, "timetaken": 0.25}]}),
    );

    let created = h
        .services
        .synchronizer(&TIMESHEET_EVENT, SyncMode::Full)
        .create(json!({
            "start_date": "2025-02-25T18:10:00Z",
            "end_date": "2025-02-25T18:25:00Z",
            "ticket_id": 10,
            "agent_id": 3,
            "charge_rate": 1,
            "note": "Replaced toner",
        }))
        .await
        .unwrap();
    assert!(created.is_none());

    match &h.remotes.script("TimesheetEvent").requests()[..] {
        [RecordedRequest::Create(payload)] => {
            assert_eq!(payload["lognewticket"], false);
            assert_eq!(payload["event_type"], 0);
        }
        other => panic!("unexpected requests {other:?}"),
    }
    let action = h.store.get("action", 107).await.unwrap().unwrap();
    assert_eq!(action.field("time_taken"), Some(&json!(0.25)));
    assert_eq!(h.store.row_count("timesheet_event"), 0);
}

#[tokio::test]
async fn logged_time_needs_a_known_ticket() {
    let h = harness(100);
    let events = h.services.synchronizer(&TIMESHEET_EVENT, SyncMode::Full);

    let err = events
        .create(json!({
            "start_date": "2025-02-25T18:10:00Z",
            "end_date": "2025-02-25T18:25:00Z",
            "ticket_id": 99,
            "agent_id": 3,
            "charge_rate": 1,
            "note": "x",
        }))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Invalid(InvalidRecord::RequiredRelation {
            relation: "ticket_id",
            remote: Some(99)
        })
    ));
    assert!(matches!(
        events.create(json!({"ticket_id": 99})).await,
        Err(SyncError::Invalid(InvalidRecord::MissingField { field: "start_date" }))
    ));
    assert!(h.remotes.script("TimesheetEvent").requests().is_empty());
    assert!(matches!(
        events.sync().await,
        Err(SyncError::Unsupported { operation: "sync", .. })
    ));
    assert!(h.store.jobs().is_empty());
}

#[tokio::test]
async fn tickets_link_teams_by_name() {
    let h = harness(100);
    h.seed_status(1).await;
    h.remotes
        .script("Team")
        .push_page(json!([{"id": 3, "name": "Field Engineers", "ticket_count": 12}]));
    assert_eq!(h.sync(&TEAM, SyncMode::Full).await.unwrap(), counts(1, 0, 0, 0));

    h.tickets().push_page(ticket_page(vec![
        json!({"id": 1, "status_id": 1, "team": "Field Engineers"}),
        json!({"id": 2, "status_id": 1, "team": "Nobody"}),
    ]));
    assert_eq!(h.sync(&TICKET, SyncMode::Full).await.unwrap(), counts(2, 0, 0, 0));

    let linked = h.store.get("ticket", 1).await.unwrap().unwrap();
    assert_eq!(linked.relation_key("team"), Some(3));
    let unlinked = h.store.get("ticket", 2).await.unwrap().unwrap();
    assert_eq!(unlinked.relation_key("team"), None);
}
