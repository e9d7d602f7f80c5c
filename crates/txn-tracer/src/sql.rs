// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SQL capture: obfuscation, statement ids and slow query aggregation.

use crate::config::RecordSql;
use fnv::FnvHasher;
use hashbrown::HashMap;
use regex::Regex;
use serde::Serialize;
use std::hash::Hasher;
use std::sync::OnceLock;
use std::time::Duration;

/// Slow queries kept per harvest.
pub const MAX_SLOW_SQLS: usize = 10;

fn literal_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(concat!(
            r#"'(?:[^'\\]|\\.|'')*'"#,
            r#"|"(?:[^"\\]|\\.)*""#,
            r"|\b0[xX][0-9a-fA-F]+\b",
            r"|\b\d+(?:\.\d+)?(?:[eE][+-]?\d+)?\b",
        ))
        .expect("literal pattern is valid")
    })
}

/// Replaces string and numeric literals with `?`.
pub fn obfuscate(sql: &str) -> String {
    literal_pattern().replace_all(sql, "?").into_owned()
}

/// Stable id of a normalized statement, as a positive 31-bit integer.
pub fn sql_id(obfuscated: &str) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(obfuscated.as_bytes());
    (hasher.finish() & 0x7fff_ffff) as u32
}

/// The SQL text to ship under `mode`, if any.
pub fn captured_sql(query: &str, mode: RecordSql) -> Option<String> {
    match mode {
        RecordSql::Off => None,
        RecordSql::Obfuscated => Some(obfuscate(query)),
        RecordSql::Raw => Some(query.to_owned()),
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SlowSqlParams {
    pub backtrace: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_path_or_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain_plan: Option<serde_json::Value>,
}

/// One normalized statement and its timings over a harvest window.
#[derive(Debug, Clone, PartialEq)]
pub struct SlowSqlSample {
    pub txn_name: String,
    pub uri: String,
    pub sql_id: u32,
    pub sql: String,
    pub metric_name: String,
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
    pub params: SlowSqlParams,
}

impl SlowSqlSample {
    pub fn new(
        txn_name: &str,
        uri: &str,
        sql: String,
        metric_name: &str,
        duration: Duration,
        params: SlowSqlParams,
    ) -> Self {
        // Ids are computed over the normalized form so raw captures of the
        // same statement aggregate together.
        let sql_id = sql_id(&obfuscate(&sql));
        Self {
            txn_name: txn_name.to_owned(),
            uri: uri.to_owned(),
            sql_id,
            sql,
            metric_name: metric_name.to_owned(),
            count: 1,
            total: duration,
            min: duration,
            max: duration,
            params,
        }
    }

    fn merge(&mut self, other: SlowSqlSample) {
        self.count += other.count;
        self.total += other.total;
        self.min = self.min.min(other.min);
        if other.max > self.max {
            self.max = other.max;
            self.txn_name = other.txn_name;
            self.uri = other.uri;
            self.sql = other.sql;
            self.metric_name = other.metric_name;
            self.params = other.params;
        }
    }
}

/// Slow queries aggregated by statement id; keeps the slowest statements
/// when more than `capacity` distinct ones arrive.
#[derive(Debug)]
pub struct SlowSqlTable {
    entries: HashMap<u32, SlowSqlSample>,
    capacity: usize,
}

impl Default for SlowSqlTable {
    fn default() -> Self {
        Self::new(MAX_SLOW_SQLS)
    }
}

impl SlowSqlTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, sample: SlowSqlSample) {
        if let Some(existing) = self.entries.get_mut(&sample.sql_id) {
            existing.merge(sample);
            return;
        }
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            let fastest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.max)
                .map(|(id, entry)| (*id, entry.max));
            match fastest {
                Some((id, max)) if max < sample.max => {
                    self.entries.remove(&id);
                }
                _ => return,
            }
        }
        self.entries.insert(sample.sql_id, sample);
    }

    /// Returns every sample, slowest first, and empties the table.
    pub fn drain(&mut self) -> Vec<SlowSqlSample> {
        let mut samples: Vec<SlowSqlSample> = self.entries.drain().map(|(_, s)| s).collect();
        samples.sort_by(|a, b| b.max.cmp(&a.max).then(a.sql_id.cmp(&b.sql_id)));
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sql: &str, ms: u64) -> SlowSqlSample {
        SlowSqlSample::new(
            "WebTransaction/Action/list",
            "/list",
            sql.to_string(),
            "Datastore/statement/MySQL/users/select",
            Duration::from_millis(ms),
            SlowSqlParams::default(),
        )
    }

    #[test]
    fn test_obfuscate() {
        assert_eq!(
            obfuscate("SELECT * FROM users WHERE id = 42 AND name = 'bob'"),
            "SELECT * FROM users WHERE id = ? AND name = ?"
        );
        assert_eq!(
            obfuscate(r#"UPDATE t1 SET note = "it's", v = 1.5e3, h = 0xFF"#),
            "UPDATE t1 SET note = ?, v = ?, h = ?"
        );
        assert_eq!(obfuscate("SELECT 'it''s'"), "SELECT ?");
        assert_eq!(obfuscate("SELECT col2 FROM table3"), "SELECT col2 FROM table3");
    }

    #[test]
    fn test_captured_sql_modes() {
        let query = "SELECT * FROM t WHERE a = 1";
        assert_eq!(captured_sql(query, RecordSql::Off), None);
        assert_eq!(
            captured_sql(query, RecordSql::Obfuscated).as_deref(),
            Some("SELECT * FROM t WHERE a = ?")
        );
        assert_eq!(captured_sql(query, RecordSql::Raw).as_deref(), Some(query));
    }

    #[test]
    fn test_sql_id_ignores_literals() {
        assert_eq!(
            sql_id(&obfuscate("SELECT * FROM t WHERE a = 1")),
            sql_id(&obfuscate("SELECT * FROM t WHERE a = 2"))
        );
        assert!(sql_id("SELECT 1") <= 0x7fff_ffff);
    }

    #[test]
    fn test_table_aggregates_by_statement() {
        let mut table = SlowSqlTable::default();
        table.add(sample("SELECT * FROM users WHERE id = 1", 600));
        table.add(sample("SELECT * FROM users WHERE id = 2", 900));
        table.add(sample("SELECT * FROM users WHERE id = 3", 700));

        let drained = table.drain();
        assert_eq!(drained.len(), 1);
        let entry = &drained[0];
        assert_eq!(entry.count, 3);
        assert_eq!(entry.total, Duration::from_millis(2200));
        assert_eq!(entry.min, Duration::from_millis(600));
        assert_eq!(entry.max, Duration::from_millis(900));
        assert_eq!(entry.sql, "SELECT * FROM users WHERE id = 2");
        assert!(table.is_empty());
    }

    #[test]
    fn test_table_keeps_slowest_statements() {
        let mut table = SlowSqlTable::new(2);
        table.add(sample("SELECT a FROM t", 500));
        table.add(sample("SELECT b FROM t", 800));
        table.add(sample("SELECT c FROM t", 600));
        table.add(sample("SELECT d FROM t", 100));

        let kept: Vec<String> = table.drain().into_iter().map(|s| s.sql).collect();
        assert_eq!(kept, vec!["SELECT b FROM t", "SELECT c FROM t"]);
    }
}
