//! Static definitions of every synced Halo entity.

use halo_client::Conditions;
use halo_core::{EntityRow, RemoteRecord};
use serde_json::Value as JsonValue;

use crate::fields::{format_timestamp, parse_halo_date, parse_key, parse_timestamp, FieldKind};
use crate::{
    float, flag, format_filter_time, halo_date, integer, text, Capabilities, ChildLink,
    EntitySpec, FetchStrategy, FieldSpec, InvalidRecord, LookupStrategy, MapContext, PageShape,
    ParentRefresh, RelationSpec,
};

/// Halo's placeholder for "no agent" and "no client".
pub const UNASSIGNED_ID: i64 = 1;

const fn halo_day(local: &'static str, remote: &'static str) -> FieldSpec {
    FieldSpec::new(local, remote, FieldKind::HaloDay)
}

const fn optional_bool(local: &'static str, remote: &'static str) -> FieldSpec {
    FieldSpec::new(local, remote, FieldKind::OptionalBool)
}

const fn timestamp(local: &'static str, remote: &'static str) -> FieldSpec {
    FieldSpec::new(local, remote, FieldKind::Timestamp)
}

/// Only ticket statuses (type 0); the remote type filter is ignored by Halo.
fn is_ticket_status(record: &RemoteRecord, _ctx: &MapContext) -> bool {
    record.get("type").and_then(parse_key) == Some(0)
}

/// Closed tickets are kept only while inside the keep-closed window.
/// Unparseable or placeholder close dates count as open.
fn is_open_or_recently_closed(record: &RemoteRecord, ctx: &MapContext) -> bool {
    let Some(closed) = record.get("dateclosed").and_then(JsonValue::as_str) else {
        return true;
    };
    match parse_halo_date(closed) {
        Ok(Some(closed)) => closed >= ctx.closed_cutoff(),
        _ => true,
    }
}

fn recently_closed_tickets(conditions: &Conditions, ctx: &MapContext) -> Conditions {
    let mut conditions = conditions.clone();
    conditions.remove("open_only");
    conditions.add("lastupdatefromdate", format_filter_time(ctx.closed_cutoff()));
    conditions.add("closed_only", true);
    conditions
}

fn join_delivery_address(record: &RemoteRecord, row: &mut EntityRow) {
    let lines: Vec<&str> = (1..=5)
        .filter_map(|line| {
            record
                .get(&format!("delivery_address_line{line}"))
                .and_then(JsonValue::as_str)
                .map(str::trim)
                .filter(|text| !text.is_empty())
        })
        .collect();
    let address = if lines.is_empty() {
        JsonValue::Null
    } else {
        JsonValue::String(lines.join(" "))
    };
    row.set_field("delivery_address", address);
}

/// Fields Halo needs to log time against a ticket.
const TIME_ENTRY_FIELDS: [&str; 6] = [
    "start_date",
    "end_date",
    "ticket_id",
    "agent_id",
    "charge_rate",
    "note",
];

/// Shape a payload as a quick time entry: dates normalized, no new ticket
/// logged, event type 0.
fn quick_time_entry(payload: &mut RemoteRecord) -> Result<(), InvalidRecord> {
    for field in TIME_ENTRY_FIELDS {
        if payload.get(field).is_none_or(JsonValue::is_null) {
            return Err(InvalidRecord::MissingField { field });
        }
    }
    for field in ["start_date", "end_date"] {
        let at = payload
            .get(field)
            .and_then(JsonValue::as_str)
            .and_then(parse_timestamp)
            .ok_or_else(|| InvalidRecord::Malformed {
                field,
                reason: "expected a timestamp".to_string(),
            })?;
        payload.insert(field.to_string(), JsonValue::String(format_timestamp(at)));
    }
    payload.insert("lognewticket".to_string(), JsonValue::Bool(false));
    payload.insert("event_type".to_string(), JsonValue::from(0));
    Ok(())
}

pub static STATUS: EntitySpec = EntitySpec {
    fields: &[text("name", "name"), text("colour", "colour")],
    validator: Some(is_ticket_status),
    bulk_prune: false,
    ..EntitySpec::base("status", "StatusSynchronizer", "Status")
};

pub static PRIORITY: EntitySpec = EntitySpec {
    lookup: LookupStrategy::Field("priorityid"),
    fields: &[
        text("name", "name"),
        text("colour", "colour"),
        optional_bool("is_hidden", "ishidden"),
    ],
    ..EntitySpec::base("priority", "PrioritySynchronizer", "Priority")
};

pub static SLA: EntitySpec = EntitySpec {
    fields: &[
        text("name", "name"),
        flag("hours_are_techs_local_time", "hoursaretechslocaltime"),
        flag("response_reset", "responsereset"),
        flag("response_reset_approval", "response_reset_approval"),
        flag("track_sla_fix_by_time", "trackslafixbytime"),
        flag("track_sla_response_time", "trackslaresponsetime"),
        integer("workday_id", "workday_id"),
        integer("auto_release_limit", "autoreleaselimit"),
        flag("auto_release_option", "autoreleaseoption"),
        integer("status_after_first_warning", "statusafterfirstwarning"),
        integer("status_after_second_warning", "statusaftersecondwarning"),
        integer("status_after_auto_release", "statusafterautorelease"),
    ],
    ..EntitySpec::base("sla", "SLASynchronizer", "SLA")
};

pub static TICKET_TYPE: EntitySpec = EntitySpec {
    fields: &[
        text("name", "name"),
        text("description", "description"),
        flag("active", "active"),
        text("use", "use"),
        text("colour", "colour"),
    ],
    ..EntitySpec::base("ticket_type", "TicketTypeSynchronizer", "TicketType")
};

pub static OUTCOME: EntitySpec = EntitySpec {
    conditions: &[("showhidden", "true")],
    fields: &[
        text("outcome", "outcome"),
        text("button_name", "buttonname"),
        text("label_long", "labellong"),
        integer("sequence", "sequence"),
        flag("hidden", "hidden"),
        text("icon", "icon"),
    ],
    ..EntitySpec::base("outcome", "OutcomeSynchronizer", "Outcome")
};

pub static CHARGE_RATE: EntitySpec = EntitySpec {
    fields: &[text("name", "name")],
    ..EntitySpec::base("charge_rate", "ChargeRateSynchronizer", "Lookup?lookupid=17")
};

pub static AGENT: EntitySpec = EntitySpec {
    conditions: &[("includeactive", "true")],
    fields: &[
        text("name", "name"),
        optional_bool("is_disabled", "isdisabled"),
        text("email", "email"),
        text("initials", "initials"),
        text("firstname", "firstname"),
        text("surname", "surname"),
        text("colour", "colour"),
    ],
    ..EntitySpec::base("agent", "AgentSynchronizer", "Agent")
};

pub static CLIENT: EntitySpec = EntitySpec {
    page_shape: PageShape::Key("clients"),
    conditions: &[("includeactive", "true")],
    fields: &[
        text("name", "name"),
        optional_bool("inactive", "inactive"),
        text("phone_number", "main_phonenumber"),
    ],
    // Sites are synced after clients, so the first pass leaves this empty.
    relations: &[RelationSpec::lookup("site", "main_site_id", "site")],
    ..EntitySpec::base("client", "ClientSynchronizer", "Client")
};

pub static SITE: EntitySpec = EntitySpec {
    page_shape: PageShape::Key("sites"),
    conditions: &[("includeaddress", "true")],
    fields: &[
        text("name", "name"),
        text("colour", "colour"),
        flag("active", "active"),
        text("phone_number", "phone_number"),
        text("use", "use"),
    ],
    relations: &[
        RelationSpec::lookup("client", "client_id", "client"),
        RelationSpec::lookup("sla", "sla_id", "sla"),
    ],
    finish_row: Some(join_delivery_address),
    ..EntitySpec::base("site", "SiteSynchronizer", "Site")
};

pub static HALO_USER: EntitySpec = EntitySpec {
    page_shape: PageShape::Key("users"),
    conditions: &[("includeactive", "true")],
    fields: &[
        text("name", "name"),
        text("first_name", "firstname"),
        text("surname", "surname"),
        text("initials", "initials"),
        text("email", "emailaddress"),
        text("colour", "colour"),
        FieldSpec::new("active", "inactive", FieldKind::NegatedFlag),
        text("login", "login"),
        text("use", "use"),
        flag("never_send_emails", "neversendemails"),
        text("phone_number", "phonenumber"),
        text("mobile_number", "mobilenumber"),
        text("mobile_number_2", "mobilenumber2"),
        text("home_number", "homenumber"),
        text("tel_pref", "telpref"),
        flag("is_service_account", "isserviceaccount"),
        flag("is_important_contact", "isimportantcontact"),
        flag("is_important_contact_2", "isimportantcontact2"),
    ],
    relations: &[
        RelationSpec::lookup("client", "client_id", "client"),
        RelationSpec::lookup("agent", "linked_agent_id", "agent").with_sentinel(0),
    ],
    ..EntitySpec::base("halo_user", "HaloUserSynchronizer", "Users")
};

pub static TEAM: EntitySpec = EntitySpec {
    fields: &[text("name", "name"), integer("ticket_count", "ticket_count")],
    ..EntitySpec::base("team", "TeamSynchronizer", "Team")
};

pub static TICKET: EntitySpec = EntitySpec {
    page_shape: PageShape::Key("tickets"),
    conditions: &[("open_only", "true")],
    watermark_param: Some("lastupdatefromdate"),
    capabilities: Capabilities::ALL,
    fields: &[
        text("summary", "summary"),
        text("details", "details"),
        timestamp("last_action_date", "lastactiondate"),
        // GET and POST responses disagree on this key.
        timestamp("last_update", "lastupdate")
            .or_remote("last_update")
            .keep_when_absent(),
        text("user_email", "useremail").keep_when_absent(),
        text("reported_by", "reportedby").keep_when_absent(),
        integer("end_user_status", "enduserstatus"),
        text("category_1", "category1").or_remote("category_1"),
        text("category_2", "category2").or_remote("category_2"),
        text("category_3", "category3").or_remote("category_3"),
        text("category_4", "category4").or_remote("category_4"),
        flag("inactive", "inactive"),
        text("sla_response_state", "sla_response_state").keep_when_absent(),
        float("sla_hold_time", "sla_hold_time").keep_when_absent(),
        integer("impact", "impact"),
        flag("flagged", "flagged"),
        flag("on_hold", "onhold"),
        float("project_time_actual", "projecttimeactual").keep_when_absent(),
        float("project_money_actual", "projectmoneyactual").keep_when_absent(),
        float("cost", "cost"),
        float("estimate", "estimate"),
        float("estimated_days", "estimateddays"),
        flag("exclude_from_slas", "excludefromslas"),
        flag("reviewed", "reviewed"),
        flag("read", "read"),
        text("use", "use").keep_when_absent(),
        text("email_to_list", "emailtolist").keep_when_absent(),
        integer("urgency", "urgency").keep_when_absent(),
        text("service_status_note", "servicestatusnote"),
        text("ticket_tags", "tickettags").keep_when_absent(),
        text("appointment_type", "appointment_type"),
        integer("impact_level", "impactlevel"),
        integer("itil_request_type", "itil_requesttype_id"),
        halo_date("date_occurred", "dateoccurred").keep_when_absent(),
        halo_date("respond_by_date", "respondbydate").keep_when_absent(),
        halo_date("fix_by_date", "fixbydate").keep_when_absent(),
        halo_date("date_assigned", "dateassigned").keep_when_absent(),
        halo_date("response_date", "responsedate").keep_when_absent(),
        halo_date("deadline_date", "deadlinedate").keep_when_absent(),
        halo_date("date_closed", "dateclosed").keep_when_absent(),
        halo_day("start_date", "startdate").keep_when_absent(),
        halo_day("target_date", "targetdate").keep_when_absent(),
        halo_date("last_incoming_email_date", "lastincomingemaildate").keep_when_absent(),
    ],
    relations: &[
        RelationSpec::lookup("client", "client_id", "client").with_sentinel(UNASSIGNED_ID),
        RelationSpec::required("status", "status_id", "status"),
        RelationSpec::lookup("priority", "priority_id", "priority"),
        RelationSpec::lookup("agent", "agent_id", "agent").with_sentinel(UNASSIGNED_ID),
        RelationSpec::lookup("sla", "sla_id", "sla"),
        RelationSpec::lookup("user", "user_id", "halo_user"),
        RelationSpec::lookup("site", "site_id", "site"),
        RelationSpec::lookup("type", "tickettype_id", "ticket_type"),
        RelationSpec::lookup("project", "parent_id", "ticket").with_sentinel(0),
        // Halo sends the team name, not its id.
        RelationSpec::lookup("team", "team", "team").by_field("name"),
    ],
    validator: Some(is_open_or_recently_closed),
    post_fetch: Some(recently_closed_tickets),
    children: &[
        ChildLink {
            entity: "appointment",
            remote_param: "ticket_id",
            relation: "ticket",
        },
        ChildLink {
            entity: "action",
            remote_param: "ticket_id",
            relation: "ticket",
        },
    ],
    ..EntitySpec::base("ticket", "TicketSynchronizer", "Tickets")
};

pub static APPOINTMENT: EntitySpec = EntitySpec {
    conditions: &[("hidecompleted", "true")],
    fields: &[
        text("subject", "subject"),
        timestamp("start_date", "start_date"),
        timestamp("end_date", "end_date"),
        text("appointment_type", "appointment_type_name"),
        optional_bool("is_private", "is_private"),
        flag("is_task", "is_task"),
        integer("complete_status", "complete_status"),
        text("colour", "colour"),
        text("online_meeting_url", "online_meeting_url"),
    ],
    relations: &[
        RelationSpec::lookup("client", "client_id", "client"),
        RelationSpec::lookup("agent", "agent_id", "agent"),
        RelationSpec::lookup("site", "site_id", "site"),
        RelationSpec::lookup("user", "user_id", "halo_user"),
        RelationSpec::owner("ticket", "ticket_id", "ticket")
            .nullable()
            .with_sentinel(0),
    ],
    ..EntitySpec::base("appointment", "AppointmentSynchronizer", "Appointment")
};

pub static ACTION: EntitySpec = EntitySpec {
    page_shape: PageShape::Key("actions"),
    // Action ids are only unique within their ticket.
    lookup: LookupStrategy::Composite("ticket_id", "id"),
    fetch: FetchStrategy::PerParent {
        parent: "ticket",
        param: "ticket_id",
    },
    capabilities: Capabilities::CREATE_UPDATE,
    impersonate_agent: true,
    fields: &[
        integer("action_id", "id"),
        halo_date("action_arrival_date", "actionarrivaldate"),
        halo_date("action_completion_date", "actioncompletiondate"),
        halo_date("action_date_created", "actiondatecreated"),
        float("time_taken", "timetaken"),
        float("time_taken_adjusted", "timetakenadjusted"),
        float("time_taken_days", "timetakendays"),
        float("non_billable_time", "nonbilltime"),
        float("travel_time", "traveltime"),
        text("note", "note"),
        float("action_charge_amount", "actionchargeamount"),
        float("action_charge_hours", "actionchargehours"),
        float("action_non_charge_amount", "actionnonchargeamount"),
        float("action_non_charge_hours", "actionnonchargehours"),
        integer("attachment_count", "attachment_count"),
        flag("act_is_billable", "actisbillable"),
        flag("hidden_from_user", "hiddenfromuser"),
        flag("important", "important"),
    ],
    relations: &[
        RelationSpec::owner("ticket", "ticket_id", "ticket"),
        RelationSpec::lookup("project", "project_id", "ticket").with_sentinel(0),
        RelationSpec::lookup("agent", "who_agentid", "agent"),
        RelationSpec::lookup("outcome", "outcome_id", "outcome"),
        RelationSpec::lookup("charge_rate", "charge_rate_id", "charge_rate"),
    ],
    ..EntitySpec::base("action", "ActionSynchronizer", "Actions")
};

/// Time logged against a ticket. Halo turns it into an action, so nothing
/// is kept locally; the ticket's children are refreshed instead.
pub static TIMESHEET_EVENT: EntitySpec = EntitySpec {
    capabilities: Capabilities {
        create: true,
        update: false,
        delete: false,
    },
    stored: false,
    prepare: Some(quick_time_entry),
    refresh_after_create: Some(ParentRefresh {
        entity: "ticket",
        field: "ticket_id",
    }),
    ..EntitySpec::base("timesheet_event", "TimesheetEventSynchronizer", "TimesheetEvent")
};

/// Every synced entity, lookups first, so relations usually resolve in one
/// pass.
pub static ALL_ENTITIES: [&EntitySpec; 14] = [
    &STATUS,
    &PRIORITY,
    &SLA,
    &TICKET_TYPE,
    &OUTCOME,
    &CHARGE_RATE,
    &AGENT,
    &CLIENT,
    &SITE,
    &HALO_USER,
    &TEAM,
    &TICKET,
    &APPOINTMENT,
    &ACTION,
];

/// Endpoints that are written to but never synced.
pub static WRITE_ONLY_ENTITIES: [&EntitySpec; 1] = [&TIMESHEET_EVENT];

pub fn entity_spec(name: &str) -> Option<&'static EntitySpec> {
    ALL_ENTITIES
        .iter()
        .chain(WRITE_ONLY_ENTITIES.iter())
        .copied()
        .find(|spec| spec.name == name)
}
