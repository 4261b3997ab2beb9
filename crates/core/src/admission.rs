//! Admission policy for outbound dispatches.
//!
//! Business hours and channel opt-outs are pure checks made here. The daily
//! cap is counted by the admission store, which reports a [`SlotOutcome`];
//! this module turns every outcome into an [`AdmissionDecision`]. Denials are
//! deferrals to the next business-hours window, never drops.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::Channel;
use crate::domain::contact::Contact;
use crate::domain::loadout::LoadoutSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "channel")]
pub enum DeferralReason {
    OutsideBusinessHours,
    DailyCapReached,
    ChannelOptedOut(Channel),
}

impl DeferralReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutsideBusinessHours => "outside_business_hours",
            Self::DailyCapReached => "daily_cap_reached",
            Self::ChannelOptedOut(_) => "channel_opted_out",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deferral {
    pub reason: DeferralReason,
    pub until: DateTime<Utc>,
}

/// What the admission store reports when asked for a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotOutcome {
    Granted { admitted_today: u32 },
    /// The dedup key already holds a slot for this day.
    AlreadyGranted,
    Exhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    Defer(Deferral),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AdmissionController;

impl AdmissionController {
    pub fn new() -> Self {
        Self
    }

    /// Calendar day in the tenant's timezone; the daily cap and dedup keys
    /// are both bucketed by it.
    pub fn local_day(&self, settings: &LoadoutSettings, now: DateTime<Utc>) -> NaiveDate {
        settings.timezone.local(now).date_naive()
    }

    pub fn within_business_hours(&self, settings: &LoadoutSettings, now: DateTime<Utc>) -> bool {
        settings.business_hours.contains_hour(settings.timezone.local(now).hour())
    }

    /// Start of the next business-hours window that begins after `now`, or
    /// today's window when `now` is before it opens.
    pub fn next_window(&self, settings: &LoadoutSettings, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = settings.timezone.local(now);
        let start_hour = settings.business_hours.start_hour;
        let today = local.date_naive();
        let day = if local.hour() < start_hour { Some(today) } else { today.succ_opt() };

        day.and_then(|day| day.and_hms_opt(start_hour, 0, 0))
            .and_then(|opening| self.to_utc(settings, opening))
            .unwrap_or_else(|| now + Duration::days(1))
    }

    /// Checks that do not consume a slot: business hours and opt-outs.
    pub fn screen(
        &self,
        settings: &LoadoutSettings,
        contact: &Contact,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<(), Deferral> {
        if contact.opted_out_of(channel) {
            return Err(Deferral {
                reason: DeferralReason::ChannelOptedOut(channel),
                until: self.next_window(settings, now),
            });
        }
        if !self.within_business_hours(settings, now) {
            return Err(Deferral {
                reason: DeferralReason::OutsideBusinessHours,
                until: self.next_window(settings, now),
            });
        }
        Ok(())
    }

    pub fn decide(
        &self,
        settings: &LoadoutSettings,
        outcome: SlotOutcome,
        now: DateTime<Utc>,
    ) -> AdmissionDecision {
        match outcome {
            SlotOutcome::Granted { .. } | SlotOutcome::AlreadyGranted => AdmissionDecision::Admit,
            SlotOutcome::Exhausted => AdmissionDecision::Defer(Deferral {
                reason: DeferralReason::DailyCapReached,
                until: self.next_window(settings, now),
            }),
        }
    }

    fn to_utc(&self, settings: &LoadoutSettings, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        settings
            .timezone
            .offset()
            .from_local_datetime(&local)
            .single()
            .map(|instant| instant.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{AdmissionController, AdmissionDecision, DeferralReason, SlotOutcome};
    use crate::domain::agent::Channel;
    use crate::domain::contact::Contact;
    use crate::domain::loadout::{LoadoutSettings, TenantId};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, hour, minute, 0).single().expect("valid instant")
    }

    fn settings_in(offset: &str) -> LoadoutSettings {
        LoadoutSettings {
            timezone: offset.parse().expect("offset"),
            allowed_channels: vec![Channel::Email, Channel::Sms],
            ..LoadoutSettings::default()
        }
    }

    fn contact() -> Contact {
        Contact::new("C-1", TenantId("tenant-a".to_string()), Decimal::from(50))
    }

    #[test]
    fn local_day_follows_the_tenant_offset() {
        let controller = AdmissionController::new();
        let late_utc = at(23, 30);

        assert_eq!(
            controller.local_day(&settings_in("UTC"), late_utc),
            NaiveDate::from_ymd_opt(2026, 3, 4).expect("date")
        );
        assert_eq!(
            controller.local_day(&settings_in("+05:30"), late_utc),
            NaiveDate::from_ymd_opt(2026, 3, 5).expect("date")
        );
    }

    #[test]
    fn business_hours_are_evaluated_in_local_time() {
        let controller = AdmissionController::new();
        assert!(controller.within_business_hours(&settings_in("UTC"), at(10, 0)));
        assert!(!controller.within_business_hours(&settings_in("UTC"), at(17, 0)));
        assert!(!controller.within_business_hours(&settings_in("-08:00"), at(10, 0)));
        assert!(controller.within_business_hours(&settings_in("-08:00"), at(18, 0)));
    }

    #[test]
    fn next_window_is_today_before_opening_and_tomorrow_after() {
        let controller = AdmissionController::new();
        let utc = settings_in("UTC");
        assert_eq!(controller.next_window(&utc, at(6, 15)), at(9, 0));
        assert_eq!(
            controller.next_window(&utc, at(12, 0)),
            Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).single().expect("valid")
        );

        let pacific = settings_in("-08:00");
        assert_eq!(controller.next_window(&pacific, at(10, 0)), at(17, 0));
    }

    #[test]
    fn opt_out_and_closed_hours_defer_to_next_window() {
        let controller = AdmissionController::new();
        let settings = settings_in("UTC");
        let mut opted_out = contact();
        opted_out.opted_out_channels.insert(Channel::Sms);

        let deferral = controller
            .screen(&settings, &opted_out, Channel::Sms, at(10, 0))
            .expect_err("deferred");
        assert_eq!(deferral.reason, DeferralReason::ChannelOptedOut(Channel::Sms));
        assert!(controller.screen(&settings, &opted_out, Channel::Email, at(10, 0)).is_ok());

        let closed = controller
            .screen(&settings, &contact(), Channel::Email, at(20, 0))
            .expect_err("closed");
        assert_eq!(closed.reason, DeferralReason::OutsideBusinessHours);
        assert!(closed.until > at(20, 0));
    }

    #[test]
    fn exhausted_slot_defers_but_repeat_key_is_admitted() {
        let controller = AdmissionController::new();
        let settings = settings_in("UTC");

        assert_eq!(
            controller.decide(&settings, SlotOutcome::AlreadyGranted, at(11, 0)),
            AdmissionDecision::Admit
        );
        assert!(matches!(
            controller.decide(&settings, SlotOutcome::Exhausted, at(11, 0)),
            AdmissionDecision::Defer(deferral) if deferral.reason == DeferralReason::DailyCapReached
        ));
    }
}
