use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::core::SequenceNumber;

/// 单次索引更新的统计
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateStats {
    /// 本次提交的视图数
    pub views_updated: usize,
    /// 读取的 changes 条数
    pub changes_scanned: usize,
    /// map 调用次数（文档 × 视图）
    pub documents_mapped: usize,
    /// 修订未变而跳过的次数
    pub documents_skipped: usize,
    /// 删除处理次数（无 map 调用）
    pub deletions: usize,
    pub rows_added: usize,
    pub rows_removed: usize,
    pub map_errors: usize,
    /// 是否走了 rayon 并行 map
    pub parallel: bool,
    pub elapsed: Duration,
}

impl UpdateStats {
    pub fn rows_changed(&self) -> bool {
        self.rows_added > 0 || self.rows_removed > 0
    }
}

/// 单视图现状
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewSummary {
    pub total_rows: usize,
    pub last_sequence_indexed: SequenceNumber,
    pub last_sequence_changed_at: SequenceNumber,
}

/// 数据库级累计报告
#[derive(Clone, Debug, Default)]
pub struct IndexReport {
    pub database: String,
    pub last_sequence: SequenceNumber,
    pub document_count: usize,
    /// 返回 200 的更新次数
    pub passes: u64,
    /// 返回 304 的更新次数
    pub not_modified: u64,
    /// 回滚（存储失败或中断）的更新次数
    pub failed: u64,
    pub totals: UpdateStats,
    pub views: BTreeMap<String, ViewSummary>,
}

impl IndexReport {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            ..Self::default()
        }
    }

    pub fn record_pass(&mut self, s: &UpdateStats) {
        self.passes += 1;
        let t = &mut self.totals;
        t.views_updated += s.views_updated;
        t.changes_scanned += s.changes_scanned;
        t.documents_mapped += s.documents_mapped;
        t.documents_skipped += s.documents_skipped;
        t.deletions += s.deletions;
        t.rows_added += s.rows_added;
        t.rows_removed += s.rows_removed;
        t.map_errors += s.map_errors;
        t.parallel |= s.parallel;
        t.elapsed += s.elapsed;
    }

    pub fn record_not_modified(&mut self) {
        self.not_modified += 1;
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }
}

fn human_duration(d: Duration) -> String {
    let us = d.as_micros();
    if us >= 1_000_000 {
        format!("{:.2} s", d.as_secs_f64())
    } else if us >= 1_000 {
        format!("{:.2} ms", us as f64 / 1_000.0)
    } else {
        format!("{} µs", us)
    }
}

impl fmt::Display for IndexReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           docview Index Report                   ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Database: {:>38} ║", self.database)?;
        writeln!(
            f,
            "║   documents:    {:>10}  last_seq: {:>10}  ║",
            self.document_count, self.last_sequence
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Updates:                                         ║")?;
        writeln!(
            f,
            "║   passes:       {:>10}  304: {:>10}       ║",
            self.passes, self.not_modified
        )?;
        writeln!(
            f,
            "║   rolled back:  {:>10}                       ║",
            self.failed
        )?;
        writeln!(
            f,
            "║   changes:      {:>10}  mapped: {:>10}    ║",
            self.totals.changes_scanned, self.totals.documents_mapped
        )?;
        writeln!(
            f,
            "║   skipped:      {:>10}  deleted: {:>9}    ║",
            self.totals.documents_skipped, self.totals.deletions
        )?;
        writeln!(
            f,
            "║   rows +/-:     {:>10} / {:<10}            ║",
            self.totals.rows_added, self.totals.rows_removed
        )?;
        writeln!(
            f,
            "║   map errors:   {:>10}                       ║",
            self.totals.map_errors
        )?;
        writeln!(
            f,
            "║   time:         {:>10}                       ║",
            human_duration(self.totals.elapsed)
        )?;
        if !self.views.is_empty() {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ Views:                                           ║")?;
            for (name, v) in &self.views {
                writeln!(f, "║   {:<46} ║", name)?;
                writeln!(
                    f,
                    "║     rows: {:>8}  indexed: {:>6}  changed: {:>5} ║",
                    v.total_rows, v.last_sequence_indexed, v.last_sequence_changed_at
                )?;
            }
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate_across_passes() {
        let mut r = IndexReport::new("db");
        let s = UpdateStats {
            views_updated: 2,
            changes_scanned: 3,
            documents_mapped: 5,
            rows_added: 4,
            map_errors: 1,
            ..UpdateStats::default()
        };
        r.record_pass(&s);
        r.record_pass(&s);
        r.record_not_modified();
        assert_eq!(r.passes, 2);
        assert_eq!(r.not_modified, 1);
        assert_eq!(r.totals.documents_mapped, 10);
        assert_eq!(r.totals.map_errors, 2);
        assert!(s.rows_changed());
    }

    #[test]
    fn report_renders_views() {
        let mut r = IndexReport::new("db");
        r.views.insert(
            "app/by_type".into(),
            ViewSummary {
                total_rows: 2,
                last_sequence_indexed: 2,
                last_sequence_changed_at: 2,
            },
        );
        let out = r.to_string();
        assert!(out.contains("docview Index Report"));
        assert!(out.contains("app/by_type"));
        assert!(out.starts_with('╔'));
    }
}
