use crate::config::BufferLimits;
use crate::models::SearchFilters;
use crate::record::{LaunchSpec, RunRecord};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use uuid::Uuid;

/// In-memory store of every run created during the process lifetime, bounded to
/// the `limit` most recent. Records leave only through eviction or a clear.
#[derive(Debug)]
pub struct RunRegistry {
    runs: VecDeque<RunRecord>,
    limit: usize,
    limits: BufferLimits,
    next_seq: u64,
}

impl RunRegistry {
    pub fn new(limit: usize, limits: BufferLimits) -> Self {
        Self {
            runs: VecDeque::new(),
            limit: limit.max(1),
            limits,
            next_seq: 0,
        }
    }

    pub fn create(&mut self, launch: LaunchSpec) -> &RunRecord {
        let id = Uuid::new_v4().to_string();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.runs
            .push_back(RunRecord::new(id, seq, launch, self.limits));

        while self.runs.len() > self.limit {
            if let Some(evicted) = self.runs.pop_front() {
                tracing::debug!(run_id = %evicted.id(), status = evicted.status().as_str(), "evicted run from history");
            }
        }

        // The record just pushed is always the newest.
        &self.runs[self.runs.len() - 1]
    }

    pub fn get(&self, id: &str) -> Option<&RunRecord> {
        self.runs.iter().find(|run| run.id() == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut RunRecord> {
        self.runs.iter_mut().find(|run| run.id() == id)
    }

    /// Oldest first, in creation order.
    pub fn list_all(&self) -> impl Iterator<Item = &RunRecord> {
        self.runs.iter()
    }

    pub fn list_active(&self) -> impl Iterator<Item = &RunRecord> {
        self.runs.iter().filter(|run| run.is_running())
    }

    /// Records the next `create` will push out of history, oldest first.
    pub(crate) fn pending_evictions(&self) -> impl Iterator<Item = &RunRecord> {
        let excess = (self.runs.len() + 1).saturating_sub(self.limit);
        self.runs.iter().take(excess)
    }

    /// Filters are ANDed. Results are most recent first.
    pub fn search(&self, filters: &SearchFilters) -> Vec<&RunRecord> {
        let needle = filters
            .q
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_lowercase();

        let mut matches = self
            .runs
            .iter()
            .filter(|run| filters.status.map_or(true, |status| run.status() == status))
            .filter(|run| {
                filters
                    .subject_name
                    .as_deref()
                    .map_or(true, |subject| run.launch().subject_name == subject)
            })
            .filter(|run| filters.started_after.map_or(true, |after| run.started_at() >= after))
            .filter(|run| filters.started_before.map_or(true, |before| run.started_at() <= before))
            .filter(|run| run.matches_text(&needle))
            .collect::<Vec<_>>();

        matches.sort_by(|a, b| {
            b.started_at()
                .cmp(&a.started_at())
                .then_with(|| b.seq().cmp(&a.seq()))
        });
        matches
    }

    pub fn remove(&mut self, id: &str) -> Option<RunRecord> {
        let index = self.runs.iter().position(|run| run.id() == id)?;
        self.runs.remove(index)
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.runs.len();
        self.runs.clear();
        removed
    }

    pub fn clear_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        self.retain(|run| run.started_at() >= cutoff)
    }

    fn retain(&mut self, keep: impl Fn(&RunRecord) -> bool) -> usize {
        let before = self.runs.len();
        self.runs.retain(|run| keep(run));
        before - self.runs.len()
    }
}
