//! In-memory stand-in for a PostgreSQL session
//!
//! `MockDb` holds the shared "server" state: tables, versioning rows and
//! advisory locks. Each `MockSession` is one connection to it, with its own
//! transaction snapshot, so two sessions can contend for the migration lock.

#![allow(dead_code)]

use chrono::Utc;
use lockstep::migration::{MigrationRecord, Version};
use lockstep::{DbError, Executor};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One statement seen by the mock, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    pub session: usize,
    pub sql: String,
    pub in_transaction: bool,
}

#[derive(Debug, Clone, Default)]
struct Data {
    tables: BTreeSet<String>,
    state_tables: BTreeSet<String>,
    rows: Vec<(String, MigrationRecord)>,
}

#[derive(Default)]
struct Server {
    data: Data,
    locks: HashMap<i64, usize>,
    log: Vec<Executed>,
    next_session: usize,
}

#[derive(Clone, Default)]
pub struct MockDb {
    server: Arc<Mutex<Server>>,
}

impl MockDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn server(&self) -> MutexGuard<'_, Server> {
        self.server.lock().expect("mock server poisoned")
    }

    pub fn session(&self) -> MockSession {
        let id = {
            let mut server = self.server();
            server.next_session += 1;
            server.next_session
        };
        MockSession {
            db: self.clone(),
            id,
            snapshot: RefCell::new(None),
            savepoints: RefCell::new(Vec::new()),
            fail_on: RefCell::new(None),
            fail_state_updates: Cell::new(false),
            after_execute: RefCell::new(None),
        }
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.server().data.tables.contains(name)
    }

    pub fn applied_versions(&self, namespace: &str) -> Vec<Version> {
        let mut versions: Vec<Version> = self
            .server()
            .data
            .rows
            .iter()
            .filter(|(_, r)| r.namespace == namespace)
            .map(|(_, r)| r.version)
            .collect();
        versions.sort();
        versions
    }

    pub fn rows(&self) -> Vec<MigrationRecord> {
        self.server().data.rows.iter().map(|(_, r)| r.clone()).collect()
    }

    /// Overwrite a stored checksum, as if the file changed after it was applied
    pub fn set_checksum(&self, version: Version, checksum: &str) {
        for (_, record) in &mut self.server().data.rows {
            if record.version == version {
                record.checksum = checksum.to_string();
            }
        }
    }

    pub fn insert_row(&self, table: &str, record: MigrationRecord) {
        let mut server = self.server();
        server.data.state_tables.insert(table.to_string());
        server.data.rows.push((table.to_string(), record));
    }

    pub fn is_locked(&self) -> bool {
        !self.server().locks.is_empty()
    }

    /// Statements executed so far, excluding lock and bookkeeping calls
    pub fn executed(&self) -> Vec<Executed> {
        self.server().log.clone()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.executed().into_iter().map(|e| e.sql).collect()
    }
}

pub struct MockSession {
    db: MockDb,
    id: usize,
    snapshot: RefCell<Option<Data>>,
    savepoints: RefCell<Vec<(String, Data)>>,
    fail_on: RefCell<Option<String>>,
    fail_state_updates: Cell<bool>,
    after_execute: RefCell<Option<Box<dyn Fn(&str)>>>,
}

impl MockSession {
    /// Fail every statement containing `needle`
    pub fn fail_on(&self, needle: &str) {
        *self.fail_on.borrow_mut() = Some(needle.to_string());
    }

    /// Fail every insert into or delete from the versioning table
    pub fn fail_state_updates(&self) {
        self.fail_state_updates.set(true);
    }

    /// Run `hook` after every successfully executed statement
    pub fn after_execute(&self, hook: impl Fn(&str) + 'static) {
        *self.after_execute.borrow_mut() = Some(Box::new(hook));
    }

    /// Run fixture SQL that must succeed
    pub fn execute_setup(&self, sql: &str) {
        self.execute(sql).expect("fixture statement");
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.borrow().is_some()
    }

    fn record(&self, server: &mut Server, sql: &str) {
        server.log.push(Executed {
            session: self.id,
            sql: sql.to_string(),
            in_transaction: self.in_transaction(),
        });
    }
}

fn table_name(tokens: &[&str]) -> Option<String> {
    tokens
        .iter()
        .find(|t| !matches!(t.to_ascii_uppercase().as_str(), "IF" | "NOT" | "EXISTS"))
        .map(|t| {
            t.split('(')
                .next()
                .unwrap_or_default()
                .trim_matches('"')
                .to_string()
        })
}

impl Executor for MockSession {
    fn execute(&self, sql: &str) -> Result<u64, DbError> {
        if let Some(needle) = self.fail_on.borrow().as_deref() {
            if sql.contains(needle) {
                return Err(DbError::Other(format!("mock failure on '{needle}'")));
            }
        }

        {
            let mut server = self.db.server();
            self.record(&mut server, sql);

            let tokens: Vec<&str> = sql.split_whitespace().collect();
            let upper: Vec<String> = tokens.iter().take(2).map(|t| t.to_ascii_uppercase()).collect();
            match upper.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
                ["CREATE", "TABLE"] => {
                    let if_not_exists = sql.to_ascii_uppercase().contains("IF NOT EXISTS");
                    let name = table_name(&tokens[2..]).unwrap_or_default();
                    if !server.data.tables.insert(name.clone()) && !if_not_exists {
                        return Err(DbError::Other(format!("relation \"{name}\" already exists")));
                    }
                }
                ["DROP", "TABLE"] => {
                    let if_exists = sql.to_ascii_uppercase().contains("IF EXISTS");
                    let name = table_name(&tokens[2..]).unwrap_or_default();
                    if !server.data.tables.remove(&name) && !if_exists {
                        return Err(DbError::Other(format!("table \"{name}\" does not exist")));
                    }
                }
                _ => {}
            }
        }

        if let Some(hook) = self.after_execute.borrow().as_ref() {
            hook(sql);
        }
        Ok(0)
    }

    fn begin(&self) -> Result<(), DbError> {
        let mut server = self.db.server();
        self.record(&mut server, "BEGIN");
        *self.snapshot.borrow_mut() = Some(server.data.clone());
        Ok(())
    }

    fn commit(&self) -> Result<(), DbError> {
        let mut server = self.db.server();
        self.snapshot.borrow_mut().take();
        self.savepoints.borrow_mut().clear();
        self.record(&mut server, "COMMIT");
        Ok(())
    }

    fn rollback(&self) -> Result<(), DbError> {
        let mut server = self.db.server();
        if let Some(snapshot) = self.snapshot.borrow_mut().take() {
            server.data = snapshot;
        }
        self.savepoints.borrow_mut().clear();
        self.record(&mut server, "ROLLBACK");
        Ok(())
    }

    fn savepoint(&self, name: &str) -> Result<(), DbError> {
        if !self.in_transaction() {
            return Err(DbError::Other("SAVEPOINT can only be used in transaction blocks".to_string()));
        }
        let mut server = self.db.server();
        self.record(&mut server, &format!("SAVEPOINT {name}"));
        let data = server.data.clone();
        self.savepoints.borrow_mut().push((name.to_string(), data));
        Ok(())
    }

    fn release_savepoint(&self, name: &str) -> Result<(), DbError> {
        let mut server = self.db.server();
        self.record(&mut server, &format!("RELEASE SAVEPOINT {name}"));
        let mut savepoints = self.savepoints.borrow_mut();
        match savepoints.iter().rposition(|(n, _)| n == name) {
            Some(at) => {
                savepoints.truncate(at);
                Ok(())
            }
            None => Err(DbError::Other(format!("savepoint \"{name}\" does not exist"))),
        }
    }

    fn rollback_to_savepoint(&self, name: &str) -> Result<(), DbError> {
        let mut server = self.db.server();
        self.record(&mut server, &format!("ROLLBACK TO SAVEPOINT {name}"));
        let mut savepoints = self.savepoints.borrow_mut();
        match savepoints.iter().rposition(|(n, _)| n == name) {
            Some(at) => {
                savepoints.truncate(at + 1);
                server.data = savepoints[at].1.clone();
                Ok(())
            }
            None => Err(DbError::Other(format!("savepoint \"{name}\" does not exist"))),
        }
    }

    fn try_advisory_lock(&self, key: i64) -> Result<bool, DbError> {
        let mut server = self.db.server();
        match server.locks.get(&key) {
            Some(holder) => Ok(*holder == self.id),
            None => {
                server.locks.insert(key, self.id);
                Ok(true)
            }
        }
    }

    fn advisory_unlock(&self, key: i64) -> Result<(), DbError> {
        let mut server = self.db.server();
        if server.locks.get(&key) == Some(&self.id) {
            server.locks.remove(&key);
        }
        Ok(())
    }

    fn ensure_state_table(&self, table: &str) -> Result<(), DbError> {
        self.db.server().data.state_tables.insert(table.to_string());
        Ok(())
    }

    fn applied_migrations(&self, table: &str, namespace: &str) -> Result<Vec<MigrationRecord>, DbError> {
        let server = self.db.server();
        if !server.data.state_tables.contains(table) {
            return Err(DbError::Other(format!("relation \"{table}\" does not exist")));
        }
        let mut records: Vec<MigrationRecord> = server
            .data
            .rows
            .iter()
            .filter(|(t, r)| t == table && r.namespace == namespace)
            .map(|(_, r)| r.clone())
            .collect();
        records.sort_by_key(|r| r.version);
        Ok(records)
    }

    fn insert_migration(&self, table: &str, record: &MigrationRecord) -> Result<(), DbError> {
        if self.fail_state_updates.get() {
            return Err(DbError::Other("mock failure writing versioning table".to_string()));
        }
        let mut server = self.db.server();
        let duplicate = server
            .data
            .rows
            .iter()
            .any(|(t, r)| t == table && r.version == record.version && r.namespace == record.namespace);
        if duplicate {
            return Err(DbError::Other("duplicate key value violates unique constraint".to_string()));
        }
        let mut stored = record.clone();
        stored.applied_at = Some(Utc::now());
        server.data.rows.push((table.to_string(), stored));
        Ok(())
    }

    fn delete_migration(&self, table: &str, namespace: &str, version: Version) -> Result<(), DbError> {
        if self.fail_state_updates.get() {
            return Err(DbError::Other("mock failure writing versioning table".to_string()));
        }
        self.db
            .server()
            .data
            .rows
            .retain(|(t, r)| !(t == table && r.namespace == namespace && r.version == version));
        Ok(())
    }
}
