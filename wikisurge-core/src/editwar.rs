//! Edit-war detector: multiple editors undoing each other on a hot page.
//!
//! A "revert" here is structural, not semantic: two consecutive byte
//! deltas of opposite sign and similar magnitude. Requiring alternating
//! sign, a ±tolerance on magnitude, and at least two distinct editors
//! keeps plain bursts and self-corrections out.

use crate::alerts::AlertPublisher;
use crate::error::Result;
use crate::keys::Keys;
use crate::metrics::Metrics;
use crate::store::{SharedStore, WarAppend};
use crate::tracker::PageStatsSource;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use wikisurge_config::EditWarConfig;
use wikisurge_model::{Alert, AlertPayload, Edit, Severity};

/// Counts disjoint revert pairs over a chronological delta sequence.
///
/// Each delta participates in at most one pair, so A:+500 B:-480 A:+510
/// B:-505 is two reverts, not three.
pub fn count_reverts(changes: &[i64], magnitude_tol: f64) -> u64 {
    let mut reverts = 0;
    let mut i = 0;
    while i + 1 < changes.len() {
        if is_revert_pair(changes[i], changes[i + 1], magnitude_tol) {
            reverts += 1;
            i += 2;
        } else {
            i += 1;
        }
    }
    reverts
}

fn is_revert_pair(a: i64, b: i64, magnitude_tol: f64) -> bool {
    if a == 0 || b == 0 || a.signum() == b.signum() {
        return false;
    }
    let ratio = a.abs() as f64 / b.abs() as f64;
    ratio >= 1.0 - magnitude_tol && ratio <= 1.0 + magnitude_tol
}

/// Severity over (distinct editors, revert pairs). `Low` is never emitted.
pub fn classify_war(editors: u64, reverts: u64) -> Severity {
    if editors >= 4 && reverts >= 3 {
        Severity::Critical
    } else if editors >= 3 || reverts >= 2 {
        Severity::High
    } else if editors >= 2 && reverts >= 1 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

pub struct EditWarDetector {
    stats: Arc<dyn PageStatsSource>,
    store: SharedStore,
    publisher: AlertPublisher,
    config: EditWarConfig,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for EditWarDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EditWarDetector")
            .field("config", &self.config)
            .finish()
    }
}

impl EditWarDetector {
    pub fn new(
        stats: Arc<dyn PageStatsSource>,
        store: SharedStore,
        publisher: AlertPublisher,
        config: EditWarConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            stats,
            store,
            publisher,
            config,
            metrics,
        }
    }

    /// Evaluates one edit. Returns the alert if one fired.
    pub async fn process_edit(&self, edit: &Edit) -> Result<Option<Alert>> {
        if !self.config.enabled || edit.bot {
            return Ok(None);
        }

        let page = edit.page_key();
        if !self.stats.is_hot(&page).await? {
            return Ok(None);
        }

        // Record this edit into the TTL'd war window; the window start
        // stamp is first-writer-wins and expires with the rest.
        self.store
            .war_append(WarAppend {
                editors_key: &Keys::editwar_editors(&page),
                changes_key: &Keys::editwar_changes(&page),
                editor: &edit.user,
                byte_delta: edit.byte_delta(),
                changes_cap: 100,
                ttl: self.config.window,
            })
            .await?;
        self.store
            .set_nx_ex(
                &Keys::editwar_started(&page),
                &edit.timestamp.to_string(),
                self.config.window,
            )
            .await?;

        let editors = self.store.hgetall(&Keys::editwar_editors(&page)).await?;
        let editor_count = editors.len() as u64;
        let edit_count: u64 = editors
            .values()
            .filter_map(|v| v.parse::<u64>().ok())
            .sum();

        if editor_count < self.config.min_editors || edit_count < self.config.min_edits {
            return Ok(None);
        }

        // Stored newest-first; revert pairs are chronological.
        let mut changes: Vec<i64> = self
            .store
            .lrange(&Keys::editwar_changes(&page), 0, -1)
            .await?
            .iter()
            .filter_map(|v| v.parse().ok())
            .collect();
        changes.reverse();

        let reverts = count_reverts(&changes, self.config.magnitude_tol);
        if reverts < self.config.min_reverts {
            return Ok(None);
        }

        let severity = classify_war(editor_count, reverts);
        if severity == Severity::Low {
            return Ok(None);
        }

        let acquired = self
            .store
            .set_nx_ex(&Keys::editwar_cooldown(&page), "1", self.config.window)
            .await?;
        if !acquired {
            debug!(page = %page, "edit war already reported for this window");
            return Ok(None);
        }

        // Marker for the selective indexer; lives as long as the window.
        self.store
            .set_nx_ex(&Keys::editwar_active(&page), "1", self.config.window)
            .await?;

        let started_at = self
            .store
            .get(&Keys::editwar_started(&page))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(edit.timestamp);

        let mut editor_names: Vec<String> = editors.into_keys().collect();
        editor_names.sort();

        let alert = Alert {
            title: edit.title.clone(),
            wiki: edit.wiki.clone(),
            timestamp: edit.timestamp,
            payload: AlertPayload::EditWar {
                editors: editor_names,
                edit_count,
                revert_count: reverts,
                severity,
                started_at,
            },
        };
        self.publisher.publish(&alert).await?;
        Metrics::incr(&self.metrics.editwar_alerts);
        info!(page = %page, editor_count, reverts, %severity, "edit war alert");
        Ok(Some(alert))
    }
}

#[async_trait::async_trait]
impl crate::consumer::EditHandler for EditWarDetector {
    fn name(&self) -> &'static str {
        "editwar-detector"
    }

    async fn handle(&self, edit: &Edit) -> Result<()> {
        self.process_edit(edit).await.map(|_| ())
    }
}
