//! Check registry: the agent's in-memory table of active
//! checks, keyed by `keyOrig`. Backed by an insertion-ordered map rather
//! than a plain hash table, since checks must be evaluated in the order
//! they were registered.

use indexmap::IndexMap;
use tracing::warn;

use crate::wire::{ActiveChecksReply, CheckRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Active,
    NotSupported,
}

/// An evaluation task.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveCheck {
    /// Resolved key; mutable, reassigned on server update.
    pub key: String,
    /// Immutable identity used for registry lookup.
    pub key_orig: String,
    /// Seconds between checks.
    pub refresh: u64,
    /// Absolute epoch seconds; 0 means "run immediately at next tick".
    pub next_check_at: i64,
    pub status: CheckStatus,
    /// Byte offset into a tailed file (log/logrt/eventlog checks only).
    pub last_log_size: i64,
    /// Modification-time marker, seconds since epoch.
    pub mtime: i64,
}

impl ActiveCheck {
    fn new(key: String, key_orig: String, refresh: u64, last_log_size: i64, mtime: i64) -> Self {
        ActiveCheck {
            key,
            key_orig,
            refresh,
            next_check_at: 0,
            status: CheckStatus::Active,
            last_log_size,
            mtime,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == CheckStatus::Active
    }

    pub fn is_runnable(&self, now: i64) -> bool {
        self.is_active() && now >= self.next_check_at
    }
}

/// The agent's current view of the check list, insertion-ordered.
#[derive(Debug, Default)]
pub struct CheckRegistry {
    checks: IndexMap<String, ActiveCheck>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn get(&self, key_orig: &str) -> Option<&ActiveCheck> {
        self.checks.get(key_orig)
    }

    pub fn get_mut(&mut self, key_orig: &str) -> Option<&mut ActiveCheck> {
        self.checks.get_mut(key_orig)
    }

    /// Iterate in registry-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ActiveCheck> {
        self.checks.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ActiveCheck> {
        self.checks.values_mut()
    }

    /// Smallest `nextCheckAt` across active entries, or `None` if none are
    /// runnable.
    pub fn min_next_check(&self) -> Option<i64> {
        self.checks
            .values()
            .filter(|c| c.is_active())
            .map(|c| c.next_check_at)
            .min()
    }

    /// Mark every current check `notSupported` before ingesting a fresh
    /// reply. Entries absent from the reply stay disabled; entries present
    /// are reactivated by `add_check`.
    pub fn mark_all_not_supported(&mut self) {
        for check in self.checks.values_mut() {
            check.status = CheckStatus::NotSupported;
        }
    }

    /// Insert a new check, or reconcile an existing one against a fresh row.
    pub fn add_check(&mut self, key: String, key_orig: String, refresh: u64, last_log_size: i64, mtime: i64) {
        if let Some(existing) = self.checks.get_mut(&key_orig) {
            if existing.key != key {
                existing.key = key;
                existing.last_log_size = last_log_size;
                existing.mtime = mtime;
            }
            if existing.refresh != refresh {
                existing.refresh = refresh;
                existing.next_check_at = 0;
            }
            existing.status = CheckStatus::Active;
        } else {
            self.checks
                .insert(key_orig.clone(), ActiveCheck::new(key, key_orig, refresh, last_log_size, mtime));
        }
    }

    /// Apply the `data` section of a successful refresh reply. The caller
    /// is responsible for checking `reply.response == "success"` first and
    /// for replacing the regexp set via
    /// [`crate::regexp::RegexpSet::replace_from_rows`].
    pub fn apply_refresh(&mut self, reply: &ActiveChecksReply) {
        self.mark_all_not_supported();

        for row in &reply.data {
            match validate_row(row) {
                Ok((key, key_orig, refresh, last_log_size, mtime)) => {
                    self.add_check(key, key_orig, refresh, last_log_size, mtime);
                }
                Err(reason) => warn!(reason, "skipping malformed check row"),
            }
        }
    }
}

fn validate_row(row: &CheckRow) -> Result<(String, String, u64, i64, i64), &'static str> {
    let key = row.key.clone().filter(|k| !k.is_empty()).ok_or("missing or empty key")?;
    let key_orig = row.key_orig.clone().filter(|k| !k.is_empty()).unwrap_or_else(|| key.clone());
    let delay = row.delay.ok_or("missing delay")?;
    if delay.0 < 0 {
        return Err("negative delay");
    }
    let last_log_size = row.lastlogsize.ok_or("missing lastlogsize")?;
    let mtime = row.mtime.map(|m| m.0).unwrap_or(0);

    Ok((key, key_orig, delay.0 as u64, last_log_size.0, mtime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FlexInt;

    fn row(key: &str, key_orig: Option<&str>, delay: i64, lls: i64, mtime: Option<i64>) -> CheckRow {
        CheckRow {
            key: Some(key.to_string()),
            key_orig: key_orig.map(|s| s.to_string()),
            delay: Some(FlexInt(delay)),
            lastlogsize: Some(FlexInt(lls)),
            mtime: mtime.map(FlexInt),
        }
    }

    fn reply(rows: Vec<CheckRow>) -> ActiveChecksReply {
        ActiveChecksReply {
            response: "success".to_string(),
            data: rows,
            regexp: vec![],
            info: None,
        }
    }

    #[test]
    fn test_cold_start_adds_new_check() {
        let mut reg = CheckRegistry::new();
        reg.apply_refresh(&reply(vec![row("system.cpu.num", None, 30, 0, None)]));
        assert_eq!(reg.len(), 1);
        let check = reg.get("system.cpu.num").unwrap();
        assert!(check.is_active());
        assert_eq!(check.next_check_at, 0);
        assert_eq!(check.refresh, 30);
    }

    #[test]
    fn test_disable_on_absence() {
        // Scenario 4: initial registry {A,B}; reply lists only {A}.
        let mut reg = CheckRegistry::new();
        reg.apply_refresh(&reply(vec![
            row("A", None, 30, 0, None),
            row("B", None, 30, 0, None),
        ]));
        reg.apply_refresh(&reply(vec![row("A", None, 30, 0, None)]));

        assert!(reg.get("A").unwrap().is_active());
        assert_eq!(reg.get("B").unwrap().status, CheckStatus::NotSupported);
    }

    #[test]
    fn test_refresh_change_resets_next_check() {
        let mut reg = CheckRegistry::new();
        reg.apply_refresh(&reply(vec![row("A", None, 30, 0, None)]));
        reg.get_mut("A").unwrap().next_check_at = 12345;
        reg.apply_refresh(&reply(vec![row("A", None, 60, 0, None)]));

        let check = reg.get("A").unwrap();
        assert_eq!(check.refresh, 60);
        assert_eq!(check.next_check_at, 0);
    }

    #[test]
    fn test_key_change_resets_offsets_server_authoritative() {
        let mut reg = CheckRegistry::new();
        reg.apply_refresh(&reply(vec![row("log[/a.log]", Some("orig1"), 5, 100, Some(7))]));
        reg.apply_refresh(&reply(vec![row("log[/b.log]", Some("orig1"), 5, 0, Some(0))]));

        let check = reg.get("orig1").unwrap();
        assert_eq!(check.key, "log[/b.log]");
        assert_eq!(check.last_log_size, 0);
        assert_eq!(check.mtime, 0);
    }

    #[test]
    fn test_missing_field_skips_row_with_warning_not_abort() {
        let mut reg = CheckRegistry::new();
        let mut bad = row("A", None, 30, 0, None);
        bad.delay = None;
        reg.apply_refresh(&reply(vec![bad, row("B", None, 30, 0, None)]));

        assert!(reg.get("A").is_none());
        assert!(reg.get("B").unwrap().is_active());
    }

    #[test]
    fn test_idempotent_refresh() {
        let mut reg = CheckRegistry::new();
        let r = reply(vec![row("A", None, 30, 0, None), row("B", None, 60, 5, Some(1))]);
        reg.apply_refresh(&r);
        let before: Vec<_> = reg.iter().cloned().collect();
        reg.apply_refresh(&r);
        let after: Vec<_> = reg.iter().cloned().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut reg = CheckRegistry::new();
        reg.apply_refresh(&reply(vec![
            row("z", None, 30, 0, None),
            row("a", None, 30, 0, None),
            row("m", None, 30, 0, None),
        ]));
        let order: Vec<_> = reg.iter().map(|c| c.key_orig.clone()).collect();
        assert_eq!(order, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_min_next_check_ignores_not_supported() {
        let mut reg = CheckRegistry::new();
        reg.apply_refresh(&reply(vec![row("A", None, 30, 0, None), row("B", None, 30, 0, None)]));
        reg.get_mut("A").unwrap().next_check_at = 500;
        reg.get_mut("B").unwrap().next_check_at = 100;
        reg.get_mut("B").unwrap().status = CheckStatus::NotSupported;
        assert_eq!(reg.min_next_check(), Some(500));
    }

    #[test]
    fn test_min_next_check_none_when_all_disabled() {
        let mut reg = CheckRegistry::new();
        reg.apply_refresh(&reply(vec![row("A", None, 30, 0, None)]));
        reg.get_mut("A").unwrap().status = CheckStatus::NotSupported;
        assert_eq!(reg.min_next_check(), None);
    }
}
