//! Derives a filter and result budget from a user question.
//!
//! Detection is pattern based and never fails: anything unrecognised leaves
//! the plan at its default (empty filter, default budget).

use super::{
    date_to_timestamp, ConversationHints, MeetingId, RetrievalPlan, MEETING_ID_FIELD,
    MEETING_ID_PATTERN, MEETING_TIMESTAMP_FIELD, SPEAKERS_FIELD, START_TIME_FIELD,
};
use crate::config::RetrievalSettings;
use crate::vector_store::{Condition, Filter, MetadataValue};
use chrono::{Datelike, Duration, NaiveDate};
use regex::Regex;
use tracing::debug;

/// Words marking a request for whole-meeting coverage.
const COMPREHENSIVE_KEYWORDS: &[&str] = &[
    "summarize", "summarise", "summary", "all", "entire", "complete", "overview", "everything",
    "full",
];

/// Plans scoped vector searches.
pub struct RetrievalPlanner {
    default_top_k: usize,
    comprehensive_multiplier: usize,
    meeting_id: Regex,
    anaphoric_meeting: Regex,
    speaker_label: Regex,
    date_between: Regex,
    date_lower: Regex,
    date_upper: Regex,
    date_bare: Regex,
    last_n_days: Regex,
    relative_day: Regex,
    first_minutes: Regex,
    between_minutes: Regex,
    after_minutes: Regex,
}

/// Half-open interval of days `[from, until)`; either end may be open.
struct DayRange {
    from: Option<NaiveDate>,
    until: Option<NaiveDate>,
}

impl RetrievalPlanner {
    pub fn new(default_top_k: usize, comprehensive_multiplier: usize) -> Self {
        let re = |pattern: &str| Regex::new(pattern).expect("Invalid regex");
        Self {
            default_top_k: default_top_k.max(1),
            comprehensive_multiplier: comprehensive_multiplier.max(2),
            meeting_id: re(MEETING_ID_PATTERN),
            anaphoric_meeting: re(r"(?i)\b(?:this|that|the same|the last) meeting\b"),
            speaker_label: re(r"(?i)\bspeaker_(\d{1,3})\b"),
            date_between: re(r"(?i)\bbetween (\d{4}-\d{2}-\d{2}) and (\d{4}-\d{2}-\d{2})\b"),
            date_lower: re(r"(?i)\b(since|after|from) (\d{4}-\d{2}-\d{2})\b"),
            date_upper: re(r"(?i)\b(?:before|until) (\d{4}-\d{2}-\d{2})\b"),
            date_bare: re(r"\b(\d{4}-\d{2}-\d{2})\b"),
            last_n_days: re(r"(?i)\b(?:last|past) (\d{1,3}) days\b"),
            relative_day: re(r"(?i)\b(today|yesterday|this week|last week|this month|last month)\b"),
            first_minutes: re(r"(?i)\bfirst (\d{1,3}) min(?:ute)?s?\b"),
            between_minutes: re(r"(?i)\bbetween minutes? (\d{1,3}) and (\d{1,3})\b"),
            after_minutes: re(r"(?i)\bafter (?:minute (\d{1,3})|(\d{1,3}) min(?:ute)?s?)\b"),
        }
    }

    pub fn from_settings(settings: &RetrievalSettings) -> Self {
        Self::new(settings.default_top_k, settings.comprehensive_multiplier)
    }

    pub fn default_top_k(&self) -> usize {
        self.default_top_k
    }

    /// Budget for whole-meeting questions about a single meeting.
    pub fn comprehensive_top_k(&self) -> usize {
        self.default_top_k.saturating_mul(self.comprehensive_multiplier)
    }

    /// Build the plan for `query`.
    pub fn plan(&self, query: &str, hints: &ConversationHints) -> RetrievalPlan {
        let mut filter = Filter::new();

        let meeting = self.detect_meeting(query, hints);
        if let Some(id) = &meeting {
            filter.push(MEETING_ID_FIELD, Condition::Eq(MetadataValue::from(id.hex())));
        }

        if let Some(range) = self.detect_dates(query, hints.today) {
            if let Some(from) = range.from {
                filter.push(MEETING_TIMESTAMP_FIELD, Condition::Gte(date_to_timestamp(from)));
            }
            if let Some(until) = range.until {
                filter.push(MEETING_TIMESTAMP_FIELD, Condition::Lt(date_to_timestamp(until)));
            }
        }

        let speakers = self.detect_speakers(query, hints);
        if !speakers.is_empty() {
            filter.push(
                SPEAKERS_FIELD,
                Condition::In(speakers.into_iter().map(MetadataValue::from).collect()),
            );
        }

        // Offsets only mean something inside one meeting
        if meeting.is_some() {
            for condition in self.detect_time_in_meeting(query) {
                filter.push(START_TIME_FIELD, condition);
            }
        }

        let comprehensive = is_comprehensive(query);
        let top_k = if comprehensive && meeting.is_some() {
            self.comprehensive_top_k()
        } else {
            self.default_top_k
        };

        let plan = RetrievalPlan {
            top_k,
            filter,
            comprehensive,
        };
        debug!("Planned retrieval: top_k={} filter={}", plan.top_k, plan.filter);
        plan
    }

    fn detect_meeting(&self, query: &str, hints: &ConversationHints) -> Option<MeetingId> {
        if let Some(caps) = self.meeting_id.captures(query) {
            return MeetingId::parse(&caps[1]);
        }
        if self.anaphoric_meeting.is_match(query) {
            return hints.active_meeting.clone();
        }
        None
    }

    fn detect_dates(&self, query: &str, today: Option<NaiveDate>) -> Option<DayRange> {
        let parse = |raw: &str| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok();

        if let Some(caps) = self.date_between.captures(query) {
            if let (Some(a), Some(b)) = (parse(&caps[1]), parse(&caps[2])) {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                return Some(DayRange {
                    from: Some(lo),
                    until: hi.succ_opt(),
                });
            }
        }

        let lower = self.date_lower.captures(query).and_then(|caps| {
            let date = parse(&caps[2])?;
            if caps[1].eq_ignore_ascii_case("after") {
                date.succ_opt()
            } else {
                Some(date)
            }
        });
        let upper = self
            .date_upper
            .captures(query)
            .and_then(|caps| parse(&caps[1]));
        if lower.is_some() || upper.is_some() {
            return Some(DayRange {
                from: lower,
                until: upper,
            });
        }

        if let Some(date) = self.date_bare.captures(query).and_then(|caps| parse(&caps[1])) {
            return Some(DayRange {
                from: Some(date),
                until: date.succ_opt(),
            });
        }

        let today = today?;
        let tomorrow = today.succ_opt();

        if let Some(caps) = self.last_n_days.captures(query) {
            let days: i64 = caps[1].parse().ok()?;
            return Some(DayRange {
                from: today.checked_sub_signed(Duration::days(days)),
                until: tomorrow,
            });
        }

        let phrase = self.relative_day.captures(query)?[1].to_ascii_lowercase();
        let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
        let first_of_month = today.with_day(1)?;
        let range = match phrase.as_str() {
            "today" => DayRange {
                from: Some(today),
                until: tomorrow,
            },
            "yesterday" => DayRange {
                from: today.pred_opt(),
                until: Some(today),
            },
            "this week" => DayRange {
                from: Some(monday),
                until: tomorrow,
            },
            "last week" => DayRange {
                from: Some(monday - Duration::days(7)),
                until: Some(monday),
            },
            "this month" => DayRange {
                from: Some(first_of_month),
                until: tomorrow,
            },
            "last month" => DayRange {
                from: first_of_month.pred_opt()?.with_day(1),
                until: Some(first_of_month),
            },
            _ => return None,
        };
        Some(range)
    }

    fn detect_speakers(&self, query: &str, hints: &ConversationHints) -> Vec<String> {
        let mut speakers: Vec<String> = self
            .speaker_label
            .captures_iter(query)
            .map(|caps| format!("SPEAKER_{}", &caps[1]))
            .collect();

        for name in &hints.known_speakers {
            let name = name.trim();
            if name.is_empty() || speakers.iter().any(|s| s == name) {
                continue;
            }
            let pattern = format!(r"(?i)\b{}\b", regex::escape(name));
            if Regex::new(&pattern).is_ok_and(|re| re.is_match(query)) {
                speakers.push(name.to_string());
            }
        }

        speakers.dedup();
        speakers
    }

    fn detect_time_in_meeting(&self, query: &str) -> Vec<Condition> {
        let minutes = |raw: &str| raw.parse::<f64>().ok().map(|m| m * 60.0);

        if let Some(caps) = self.between_minutes.captures(query) {
            if let (Some(a), Some(b)) = (minutes(&caps[1]), minutes(&caps[2])) {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                return vec![Condition::Gte(lo), Condition::Lt(hi)];
            }
        }
        if let Some(bound) = self
            .first_minutes
            .captures(query)
            .and_then(|caps| minutes(&caps[1]))
        {
            return vec![Condition::Lt(bound)];
        }
        if let Some(bound) = self
            .after_minutes
            .captures(query)
            .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
            .and_then(|m| minutes(m.as_str()))
        {
            return vec![Condition::Gte(bound)];
        }
        Vec::new()
    }
}

impl Default for RetrievalPlanner {
    fn default() -> Self {
        Self::from_settings(&RetrievalSettings::default())
    }
}

fn is_comprehensive(query: &str) -> bool {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| COMPREHENSIVE_KEYWORDS.contains(&word))
}
