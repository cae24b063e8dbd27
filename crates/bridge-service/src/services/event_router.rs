//! Event routing and side-effect reconciliation.
//!
//! Each webhook event kind maps to a handler that brings DingTalk in line
//! with the meeting's state. The idempotency store records every live
//! to-do and calendar entry, so redelivered events never create duplicates
//! and updates or deletes find the object they act on.
//!
//! Missing prerequisites (no meeting info, unresolved identity, unknown
//! meeting, no record to update or delete) are logged and end the handler
//! with `Ok(())`. Downstream and store failures are returned so the
//! dispatcher logs them against the task's event kind.

use crate::errors::BridgeError;
use crate::models::{
    EventKind, EventPayload, MeetingDetail, MeetingType, SideEffectKind, SideEffectRecord,
    WebhookEvent, WebhookMeetingInfo,
};
use crate::observability::metrics;
use crate::repositories::SideEffectStore;
use crate::services::dingtalk_client::{Notifier, RecordingCard, MAX_CARD_RECIPIENTS};
use crate::services::identity::IdentityResolver;
use crate::services::meeting_locks::MeetingLocks;
use crate::services::wemeet_client::MeetingDirectory;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Recordings are looked up from this long before the scheduled start.
const RECORDING_LOOKBACK_SECS: i64 = 24 * 60 * 60;

/// Which DingTalk side effects are produced.
#[derive(Debug, Clone, Copy)]
pub struct SideEffectSwitches {
    pub todo: bool,
    pub calendar: bool,
}

impl Default for SideEffectSwitches {
    fn default() -> Self {
        Self {
            todo: true,
            calendar: true,
        }
    }
}

/// Collaborators the router works against.
pub struct EventRouterDeps {
    pub directory: Arc<dyn MeetingDirectory>,
    pub notifier: Arc<dyn Notifier>,
    pub identities: Arc<dyn IdentityResolver>,
    pub store: Arc<dyn SideEffectStore>,
}

pub struct EventRouter {
    directory: Arc<dyn MeetingDirectory>,
    notifier: Arc<dyn Notifier>,
    identities: Arc<dyn IdentityResolver>,
    store: Arc<dyn SideEffectStore>,
    switches: SideEffectSwitches,
    locks: MeetingLocks,
}

/// Remove duplicates, keeping the first occurrence.
fn dedup_preserving_order(ids: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

impl EventRouter {
    pub fn new(deps: EventRouterDeps, switches: SideEffectSwitches) -> Self {
        Self {
            directory: deps.directory,
            notifier: deps.notifier,
            identities: deps.identities,
            store: deps.store,
            switches,
            locks: MeetingLocks::new(),
        }
    }

    /// Handle an acknowledged callback body.
    ///
    /// Unknown kinds and bodies that do not fit the event model are logged
    /// and dropped.
    pub async fn route_raw(&self, raw: serde_json::Value) -> Result<(), BridgeError> {
        let kind = EventKind::parse(
            raw.get("event")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default(),
        );
        if let EventKind::Unknown(raw_kind) = &kind {
            warn!(target: "bridge.events", event = %raw_kind, "Unsupported event kind, dropping");
            return Ok(());
        }

        match serde_json::from_value::<WebhookEvent>(raw) {
            Ok(event) => self.route(&event).await,
            Err(e) => {
                warn!(target: "bridge.events", event = kind.as_str(), error = %e, "Event body has an unexpected shape, dropping");
                Ok(())
            }
        }
    }

    /// Handle one decoded webhook event.
    #[instrument(skip_all, name = "bridge.events.route", fields(event = %event.event))]
    pub async fn route(&self, event: &WebhookEvent) -> Result<(), BridgeError> {
        let kind = event.kind();
        if let EventKind::Unknown(raw) = &kind {
            warn!(target: "bridge.events", event = %raw, "Unsupported event kind, dropping");
            return Ok(());
        }

        let Some(payload) = event.first_payload() else {
            warn!(target: "bridge.events", "Event has no payload, dropping");
            return Ok(());
        };
        let Some(info) = payload.meeting_info.as_ref() else {
            warn!(target: "bridge.events", "Event has no meeting info, dropping");
            return Ok(());
        };

        info!(
            target: "bridge.events",
            meeting_id = %info.meeting_id,
            meeting_type = ?info.meeting_type,
            trace_id = event.trace_id.as_deref().unwrap_or_default(),
            "Handling event"
        );

        if kind == EventKind::RecordingCompleted {
            return self.on_recording_completed(info).await;
        }

        if info.is_quick_meeting() {
            debug!(target: "bridge.events", meeting_id = %info.meeting_id, "Quick meeting, nothing to reconcile");
            return Ok(());
        }

        let _guard = self.locks.lock(&info.meeting_id).await;

        match kind {
            EventKind::MeetingCreated => self.on_created(info).await,
            EventKind::MeetingUpdated => self.on_updated(info).await,
            EventKind::MeetingCanceled => self.on_canceled(info).await,
            EventKind::MeetingEnd => self.on_end(info, payload).await,
            EventKind::RecordingCompleted | EventKind::Unknown(_) => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Meeting lifecycle
    // ------------------------------------------------------------------

    async fn on_created(&self, info: &WebhookMeetingInfo) -> Result<(), BridgeError> {
        let Some((owner, detail, recipients)) = self.prepare(info).await? else {
            return Ok(());
        };

        if info.meeting_type.is_single_occurrence() {
            if recipients.is_empty() {
                warn!(target: "bridge.events", meeting_id = %info.meeting_id, "No resolvable recipients, skipping");
                return Ok(());
            }

            let todo = if self.switches.todo {
                self.create_todo(&info.meeting_id, &owner, &detail, &recipients)
                    .await
            } else {
                Ok(())
            };
            let calendar = if self.switches.calendar {
                self.create_calendar(&info.meeting_id, &owner, &detail, &recipients)
                    .await
            } else {
                Ok(())
            };
            return todo.and(calendar);
        }

        if info.meeting_type.is_recurring() {
            return self
                .create_calendar(&info.meeting_id, &owner, &detail, &recipients)
                .await;
        }

        debug!(target: "bridge.events", meeting_type = ?info.meeting_type, "Meeting type not synchronized");
        Ok(())
    }

    async fn on_updated(&self, info: &WebhookMeetingInfo) -> Result<(), BridgeError> {
        let Some((owner, detail, recipients)) = self.prepare(info).await? else {
            return Ok(());
        };

        if info.meeting_type.is_single_occurrence() {
            if recipients.is_empty() {
                warn!(target: "bridge.events", meeting_id = %info.meeting_id, "No resolvable recipients, skipping");
                return Ok(());
            }

            let todo = if self.switches.todo {
                self.replace_todo(&info.meeting_id, &owner, &detail, &recipients)
                    .await
            } else {
                Ok(())
            };
            let calendar = if self.switches.calendar {
                self.update_calendar(&info.meeting_id, &detail, &recipients)
                    .await
            } else {
                Ok(())
            };
            return todo.and(calendar);
        }

        if info.meeting_type.is_recurring() {
            if info.targets_single_occurrence() {
                info!(
                    target: "bridge.events",
                    meeting_id = %info.meeting_id,
                    "Single occurrence edited, calendar series left unchanged"
                );
                return Ok(());
            }
            return self
                .update_calendar(&info.meeting_id, &detail, &recipients)
                .await;
        }

        Ok(())
    }

    async fn on_canceled(&self, info: &WebhookMeetingInfo) -> Result<(), BridgeError> {
        if info.meeting_type.is_single_occurrence() {
            let todo = if self.switches.todo {
                self.remove(&info.meeting_id, SideEffectKind::Todo).await
            } else {
                Ok(())
            };
            let calendar = if self.switches.calendar {
                self.remove(&info.meeting_id, SideEffectKind::Calendar)
                    .await
            } else {
                Ok(())
            };
            return todo.and(calendar);
        }

        if info.meeting_type.is_recurring() {
            if info.targets_single_occurrence() {
                info!(
                    target: "bridge.events",
                    meeting_id = %info.meeting_id,
                    "Single occurrence canceled, calendar series left unchanged"
                );
                return Ok(());
            }
            return self
                .remove(&info.meeting_id, SideEffectKind::Calendar)
                .await;
        }

        Ok(())
    }

    async fn on_end(
        &self,
        info: &WebhookMeetingInfo,
        payload: &EventPayload,
    ) -> Result<(), BridgeError> {
        if info.meeting_type == MeetingType::Recurring {
            return Ok(());
        }

        // Ending before the scheduled start keeps the to-do for the real meeting
        if info.start_time.saturating_mul(1000) > payload.operate_time {
            debug!(
                target: "bridge.events",
                meeting_id = %info.meeting_id,
                "Meeting ended before its scheduled start, keeping to-do"
            );
            return Ok(());
        }

        if !self.switches.todo {
            return Ok(());
        }

        self.remove(&info.meeting_id, SideEffectKind::Todo).await
    }

    /// Resolve the owner, load the meeting, and build the recipient list.
    ///
    /// Recipients are the creator followed by current hosts, hosts and
    /// participants, as union ids, de-duplicated. Users without a DingTalk
    /// account are left out.
    async fn prepare(
        &self,
        info: &WebhookMeetingInfo,
    ) -> Result<Option<(String, MeetingDetail, Vec<String>)>, BridgeError> {
        let creator = &info.creator.userid;

        let Some(owner) = self.identities.resolve(creator).await? else {
            warn!(target: "bridge.events", meeting_id = %info.meeting_id, "Creator has no DingTalk identity, skipping");
            return Ok(None);
        };

        let Some(detail) = self
            .directory
            .meeting_detail(&info.meeting_id, creator)
            .await?
        else {
            warn!(target: "bridge.events", meeting_id = %info.meeting_id, "Meeting detail not found, skipping");
            return Ok(None);
        };

        let mut union_ids = vec![owner.clone()];
        for userid in detail.invitee_userids() {
            match self.identities.resolve(userid).await {
                Ok(Some(union_id)) => union_ids.push(union_id),
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "bridge.events", userid = %userid, error = %e, "Identity lookup failed, leaving user out");
                }
            }
        }
        let recipients = dedup_preserving_order(union_ids);

        debug!(
            target: "bridge.events",
            current_hosts = detail.current_hosts.len(),
            hosts = detail.hosts.len(),
            participants = detail.participants.len(),
            recipients = recipients.len(),
            "Recipients resolved"
        );

        Ok(Some((owner, detail, recipients)))
    }

    // ------------------------------------------------------------------
    // Side effects
    // ------------------------------------------------------------------

    async fn create_todo(
        &self,
        meeting_id: &str,
        owner: &str,
        detail: &MeetingDetail,
        recipients: &[String],
    ) -> Result<(), BridgeError> {
        if self
            .store
            .find(meeting_id, SideEffectKind::Todo)
            .await?
            .is_some()
        {
            info!(target: "bridge.events", meeting_id = %meeting_id, "To-do already exists, skipping");
            metrics::record_side_effect("todo", "create", "skipped");
            return Ok(());
        }

        let task_id = match self.notifier.create_todo(owner, detail, recipients).await {
            Ok(task_id) => task_id,
            Err(e) => {
                metrics::record_side_effect("todo", "create", "error");
                return Err(e);
            }
        };

        self.remember(meeting_id, SideEffectKind::Todo, task_id, owner)
            .await?;
        metrics::record_side_effect("todo", "create", "success");
        info!(target: "bridge.events", meeting_id = %meeting_id, "To-do created");
        Ok(())
    }

    async fn create_calendar(
        &self,
        meeting_id: &str,
        owner: &str,
        detail: &MeetingDetail,
        recipients: &[String],
    ) -> Result<(), BridgeError> {
        if self
            .store
            .find(meeting_id, SideEffectKind::Calendar)
            .await?
            .is_some()
        {
            info!(target: "bridge.events", meeting_id = %meeting_id, "Calendar event already exists, skipping");
            metrics::record_side_effect("calendar", "create", "skipped");
            return Ok(());
        }

        let event_id = match self
            .notifier
            .create_calendar_event(owner, detail, recipients)
            .await
        {
            Ok(event_id) => event_id,
            Err(e) => {
                metrics::record_side_effect("calendar", "create", "error");
                return Err(e);
            }
        };

        self.remember(meeting_id, SideEffectKind::Calendar, event_id, owner)
            .await?;
        metrics::record_side_effect("calendar", "create", "success");
        info!(target: "bridge.events", meeting_id = %meeting_id, "Calendar event created");
        Ok(())
    }

    /// DingTalk cannot move a to-do's reminder, so updates delete and recreate.
    async fn replace_todo(
        &self,
        meeting_id: &str,
        owner: &str,
        detail: &MeetingDetail,
        recipients: &[String],
    ) -> Result<(), BridgeError> {
        if self
            .store
            .find(meeting_id, SideEffectKind::Todo)
            .await?
            .is_none()
        {
            warn!(target: "bridge.events", meeting_id = %meeting_id, "To-do to update not found");
            metrics::record_side_effect("todo", "update", "skipped");
            return Ok(());
        }

        self.remove(meeting_id, SideEffectKind::Todo).await?;
        self.create_todo(meeting_id, owner, detail, recipients)
            .await
    }

    async fn update_calendar(
        &self,
        meeting_id: &str,
        detail: &MeetingDetail,
        recipients: &[String],
    ) -> Result<(), BridgeError> {
        let Some(record) = self
            .store
            .find(meeting_id, SideEffectKind::Calendar)
            .await?
        else {
            warn!(target: "bridge.events", meeting_id = %meeting_id, "Calendar event to update not found");
            metrics::record_side_effect("calendar", "update", "skipped");
            return Ok(());
        };

        if let Err(e) = self
            .notifier
            .update_calendar_event(&record.owner_id, &record.external_id, detail, recipients)
            .await
        {
            metrics::record_side_effect("calendar", "update", "error");
            return Err(e);
        }

        metrics::record_side_effect("calendar", "update", "success");
        info!(target: "bridge.events", meeting_id = %meeting_id, "Calendar event updated");
        Ok(())
    }

    /// Delete a tracked side effect under the identity that created it.
    async fn remove(&self, meeting_id: &str, kind: SideEffectKind) -> Result<(), BridgeError> {
        let label = kind.as_str();

        let Some(record) = self.store.find(meeting_id, kind).await? else {
            info!(target: "bridge.events", meeting_id = %meeting_id, effect = label, "Nothing to delete, record not found");
            metrics::record_side_effect(label, "delete", "skipped");
            return Ok(());
        };

        let deleted = match kind {
            SideEffectKind::Todo => {
                self.notifier
                    .delete_todo(&record.owner_id, &record.external_id)
                    .await
            }
            SideEffectKind::Calendar => {
                self.notifier
                    .delete_calendar_event(&record.owner_id, &record.external_id)
                    .await
            }
        };
        if let Err(e) = deleted {
            metrics::record_side_effect(label, "delete", "error");
            return Err(e);
        }

        self.store.delete(meeting_id, kind).await?;
        metrics::record_side_effect(label, "delete", "success");
        info!(target: "bridge.events", meeting_id = %meeting_id, effect = label, "Side effect deleted");
        Ok(())
    }

    async fn remember(
        &self,
        meeting_id: &str,
        kind: SideEffectKind,
        external_id: String,
        owner: &str,
    ) -> Result<(), BridgeError> {
        let record = SideEffectRecord {
            meeting_id: meeting_id.to_string(),
            kind,
            external_id,
            owner_id: owner.to_string(),
            created_at: Utc::now(),
        };

        if !self.store.insert(&record).await? {
            warn!(
                target: "bridge.events",
                meeting_id = %meeting_id,
                effect = kind.as_str(),
                "Record already present, keeping the existing one"
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Recordings
    // ------------------------------------------------------------------

    /// Share a finished recording with everyone who attended.
    ///
    /// Not tracked for idempotency: a redelivered event sends the cards again.
    async fn on_recording_completed(&self, info: &WebhookMeetingInfo) -> Result<(), BridgeError> {
        let creator = &info.creator.userid;
        let since = info.start_time.saturating_sub(RECORDING_LOOKBACK_SECS);

        let Some(record_id) = self
            .directory
            .latest_recording(&info.meeting_id, creator, since)
            .await?
        else {
            warn!(target: "bridge.events", meeting_id = %info.meeting_id, "No recording found");
            return Ok(());
        };

        // With several files the first may still be processing; a later event
        // for the same meeting carries the address
        let Some(view_address) = self
            .directory
            .recording_address(&record_id, creator)
            .await?
        else {
            warn!(target: "bridge.events", meeting_id = %info.meeting_id, "Recording address not ready");
            return Ok(());
        };

        let attendees = dedup_preserving_order(
            self.directory
                .meeting_participants(&info.meeting_id, creator)
                .await?,
        );
        if attendees.is_empty() {
            info!(target: "bridge.events", meeting_id = %info.meeting_id, "No attendees to notify");
            return Ok(());
        }

        let card = RecordingCard {
            subject: info.subject.clone(),
            meeting_code: info.meeting_code.clone(),
            start_time: info.start_time,
            end_time: info.end_time,
            creator_name: info.creator.user_name.clone(),
            view_address,
        };

        let mut failed_batches = 0usize;
        for (index, batch) in attendees.chunks(MAX_CARD_RECIPIENTS).enumerate() {
            debug!(target: "bridge.events", batch = index + 1, size = batch.len(), "Sending recording card");
            match self.notifier.send_recording_card(batch, &card).await {
                Ok(()) => metrics::record_side_effect("card", "send", "success"),
                Err(e) => {
                    failed_batches += 1;
                    metrics::record_side_effect("card", "send", "error");
                    warn!(target: "bridge.events", batch = index + 1, error = %e, "Recording card batch failed");
                }
            }
        }

        if failed_batches > 0 {
            return Err(BridgeError::Downstream(format!(
                "{failed_batches} recording card batch(es) failed"
            )));
        }

        info!(
            target: "bridge.events",
            meeting_id = %info.meeting_id,
            recipients = attendees.len(),
            "Recording shared"
        );
        Ok(())
    }
}
