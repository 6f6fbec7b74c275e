//! Tick planning
//!
//! Tracks, per (pipeline, kind), the last tick handed to the queue during the
//! current leadership term. Each evaluation yields at most the latest tick in
//! `(cursor, now]`; older ticks in the same window are counted as discarded
//! and never enqueued, so a long outage costs one catch-up job per
//! pipeline and kind rather than a backlog.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use openanomaly_core::domain::job::{JobKind, ScheduleTick};
use openanomaly_core::domain::lease::FencingToken;
use openanomaly_core::schedule::CronSchedule;

/// A tick to enqueue, plus how many older ticks it supersedes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTick {
    pub tick: ScheduleTick,
    pub discarded: usize,
}

#[derive(Debug)]
pub struct TickPlanner {
    catch_up: bool,
    term: Option<FencingToken>,
    cursors: HashMap<(String, JobKind), DateTime<Utc>>,
}

impl TickPlanner {
    /// # Arguments
    /// * `catch_up` - When a cursor is first seeded, start from the last due
    ///   time already in the queue rather than from now, so the most recent
    ///   missed tick is enqueued
    pub fn new(catch_up: bool) -> Self {
        Self {
            catch_up,
            term: None,
            cursors: HashMap::new(),
        }
    }

    pub fn catch_up(&self) -> bool {
        self.catch_up
    }

    /// Enter the term of `token`. Cursors from any other term are dropped.
    pub fn begin_term(&mut self, token: FencingToken) -> bool {
        if self.term == Some(token) {
            return false;
        }
        self.term = Some(token);
        self.cursors.clear();
        true
    }

    /// Forget everything, e.g. after losing leadership
    pub fn reset(&mut self) {
        self.term = None;
        self.cursors.clear();
    }

    pub fn term(&self) -> Option<FencingToken> {
        self.term
    }

    pub fn has_cursor(&self, pipeline: &str, kind: JobKind) -> bool {
        self.cursors.contains_key(&(pipeline.to_string(), kind))
    }

    /// Start tracking a pipeline and kind from `from`
    ///
    /// # Arguments
    /// * `last_due` - Latest due time already enqueued by any term
    /// * `now` - Evaluation time
    pub fn seed(
        &mut self,
        pipeline: &str,
        kind: JobKind,
        last_due: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let from = match last_due {
            Some(due) if self.catch_up => due.min(now),
            _ => now,
        };
        self.cursors.insert((pipeline.to_string(), kind), from);
    }

    /// Latest tick due in `(cursor, now]`, if any. The cursor is not moved
    /// until [`TickPlanner::advance`] confirms the tick reached the queue.
    pub fn due(
        &self,
        pipeline: &str,
        kind: JobKind,
        schedule: &CronSchedule,
        now: DateTime<Utc>,
    ) -> Option<PlannedTick> {
        let cursor = self.cursors.get(&(pipeline.to_string(), kind))?;
        let window = schedule.ticks_between(*cursor, now);
        window.latest.map(|due_at| PlannedTick {
            tick: ScheduleTick {
                pipeline: pipeline.to_string(),
                kind,
                due_at,
            },
            discarded: window.count.saturating_sub(1),
        })
    }

    pub fn advance(&mut self, pipeline: &str, kind: JobKind, due_at: DateTime<Utc>) {
        let cursor = self
            .cursors
            .entry((pipeline.to_string(), kind))
            .or_insert(due_at);
        if due_at > *cursor {
            *cursor = due_at;
        }
    }

    /// Drop cursors for pipelines and kinds no longer scheduled
    pub fn retain(&mut self, scheduled: &HashSet<(String, JobKind)>) {
        self.cursors.retain(|key, _| scheduled.contains(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    fn every_five() -> CronSchedule {
        CronSchedule::parse("*/5 * * * *").unwrap()
    }

    #[test]
    fn test_resumes_from_now_without_catch_up() {
        let mut planner = TickPlanner::new(false);
        planner.begin_term(FencingToken(1));
        planner.seed("cpu", JobKind::Forecast, Some(at(11, 0)), at(12, 2));

        assert_eq!(planner.due("cpu", JobKind::Forecast, &every_five(), at(12, 2)), None);

        let planned = planner
            .due("cpu", JobKind::Forecast, &every_five(), at(12, 5))
            .unwrap();
        assert_eq!(planned.tick.due_at, at(12, 5));
        assert_eq!(planned.discarded, 0);
    }

    #[test]
    fn test_catch_up_enqueues_only_latest_missed_tick() {
        let mut planner = TickPlanner::new(true);
        planner.begin_term(FencingToken(2));
        planner.seed("cpu", JobKind::Forecast, Some(at(11, 0)), at(12, 2));

        let planned = planner
            .due("cpu", JobKind::Forecast, &every_five(), at(12, 2))
            .unwrap();
        assert_eq!(planned.tick.due_at, at(12, 0));
        // 11:05 .. 11:55 were missed and are reported, not replayed.
        assert_eq!(planned.discarded, 11);

        planner.advance("cpu", JobKind::Forecast, planned.tick.due_at);
        assert_eq!(planner.due("cpu", JobKind::Forecast, &every_five(), at(12, 4)), None);
    }

    #[test]
    fn test_catch_up_without_history_starts_now() {
        let mut planner = TickPlanner::new(true);
        planner.begin_term(FencingToken(1));
        planner.seed("cpu", JobKind::Anomaly, None, at(12, 2));
        assert_eq!(planner.due("cpu", JobKind::Anomaly, &every_five(), at(12, 2)), None);
    }

    #[test]
    fn test_cursor_moves_only_on_advance() {
        let mut planner = TickPlanner::new(false);
        planner.begin_term(FencingToken(1));
        planner.seed("cpu", JobKind::Forecast, None, at(12, 0));

        let first = planner.due("cpu", JobKind::Forecast, &every_five(), at(12, 5));
        let again = planner.due("cpu", JobKind::Forecast, &every_five(), at(12, 5));
        assert_eq!(first, again);

        planner.advance("cpu", JobKind::Forecast, at(12, 5));
        assert_eq!(planner.due("cpu", JobKind::Forecast, &every_five(), at(12, 5)), None);
    }

    #[test]
    fn test_new_term_drops_cursors() {
        let mut planner = TickPlanner::new(false);
        assert!(planner.begin_term(FencingToken(1)));
        planner.seed("cpu", JobKind::Forecast, None, at(12, 0));
        assert!(!planner.begin_term(FencingToken(1)));
        assert!(planner.has_cursor("cpu", JobKind::Forecast));

        assert!(planner.begin_term(FencingToken(2)));
        assert!(!planner.has_cursor("cpu", JobKind::Forecast));

        planner.seed("cpu", JobKind::Forecast, None, at(12, 0));
        planner.reset();
        assert_eq!(planner.term(), None);
        assert!(!planner.has_cursor("cpu", JobKind::Forecast));
    }

    #[test]
    fn test_retain_prunes_removed_pipelines() {
        let mut planner = TickPlanner::new(false);
        planner.begin_term(FencingToken(1));
        planner.seed("cpu", JobKind::Forecast, None, at(12, 0));
        planner.seed("mem", JobKind::Forecast, None, at(12, 0));

        let scheduled = HashSet::from([("cpu".to_string(), JobKind::Forecast)]);
        planner.retain(&scheduled);
        assert!(planner.has_cursor("cpu", JobKind::Forecast));
        assert!(!planner.has_cursor("mem", JobKind::Forecast));
    }
}
