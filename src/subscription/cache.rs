//! Local row cache for subscribed tables.
//!
//! One reader-writer lock guards the whole cache: the subscription delta
//! path is the only writer, typed accessors are readers. Accessors never
//! suspend; they return a snapshot taken under a short-held read lock.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use sd_core::{Circle, Entity, Player, TableRow, Vec2};

#[derive(Debug, Default)]
pub struct TableCache {
    tables: RwLock<HashMap<String, HashMap<String, TableRow>>>,
}

impl TableCache {
    pub fn new() -> TableCache {
        TableCache::default()
    }

    /// Insert or replace a row; returns the previous row for the key.
    pub fn upsert(&self, table: &str, key: String, row: TableRow) -> Option<TableRow> {
        self.tables
            .write()
            .unwrap()
            .entry(table.to_owned())
            .or_default()
            .insert(key, row)
    }

    pub fn remove(&self, table: &str, key: &str) -> Option<TableRow> {
        self.tables
            .write()
            .unwrap()
            .get_mut(table)
            .and_then(|rows| rows.remove(key))
    }

    /// Replace a table's full contents (initial snapshot).
    pub fn replace_table(&self, table: &str, rows: Vec<(String, TableRow)>) {
        let mut tables = self.tables.write().unwrap();
        let entry = tables.entry(table.to_owned()).or_default();
        entry.clear();
        entry.extend(rows);
    }

    /// Clear one table's cache, or every table's when `table` is `None`.
    /// Subscriptions themselves are untouched.
    pub fn clear(&self, table: Option<&str>) {
        let mut tables = self.tables.write().unwrap();
        match table {
            Some(name) => {
                tables.remove(name);
            }
            None => tables.clear(),
        }
    }

    pub fn get(&self, table: &str, key: &str) -> Option<TableRow> {
        self.tables
            .read()
            .unwrap()
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    pub fn contains(&self, table: &str, key: &str) -> bool {
        self.tables
            .read()
            .unwrap()
            .get(table)
            .map(|rows| rows.contains_key(key))
            .unwrap_or(false)
    }

    pub fn rows(&self, table: &str) -> Vec<TableRow> {
        self.tables
            .read()
            .unwrap()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .unwrap()
            .get(table)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    // -- typed accessors --

    /// All players that currently validate; undecodable rows are skipped.
    pub fn players(&self) -> Vec<Player> {
        self.typed("player")
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.typed("entity")
    }

    pub fn circles(&self) -> Vec<Circle> {
        self.typed("circle")
    }

    /// Linear scan over the entity table for entities within `radius` of
    /// `center`.
    pub fn entities_near(&self, center: Vec2, radius: f64) -> Vec<Entity> {
        self.entities()
            .into_iter()
            .filter(|e| e.position.distance_to(&center) <= radius)
            .collect()
    }

    fn typed<T>(&self, table: &str) -> Vec<T>
    where
        T: for<'r> TryFrom<&'r TableRow>,
        for<'r> <T as TryFrom<&'r TableRow>>::Error: std::fmt::Display,
    {
        let tables = self.tables.read().unwrap();
        let rows = match tables.get(table) {
            Some(rows) => rows,
            None => return Vec::new(),
        };
        let mut out = Vec::with_capacity(rows.len());
        for row in rows.values() {
            match T::try_from(row) {
                Ok(value) => out.push(value),
                Err(e) => debug!(table, error = %e, "skipping undecodable cached row"),
            }
        }
        out
    }
}
