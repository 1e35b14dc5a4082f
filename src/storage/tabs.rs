// Tabs data model and storage operations
// Tabs are query editors or table browsers; each may be bound to one live pool
// and keeps the output of the last statement it ran

use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::database::{DatabaseManager, StorageError, StorageResult};
use crate::db::cell::{Cell, TabOutput};
use crate::db::reconciler::{ActivationScope, ActiveContext, SessionStore};
use crate::db::traits::PoolHandle;

const DEFAULT_TAB_NAME: &str = "Editor";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TabType {
    Editor,
    Table,
}

impl TabType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabType::Editor => "editor",
            TabType::Table => "table",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "editor" => Some(TabType::Editor),
            "table" => Some(TabType::Table),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tab {
    pub id: i64,
    pub name: String,
    pub editor: String,
    pub is_active: bool,
    pub active_pool_id: Option<PoolHandle>,
    pub active_db: Option<String>,
    pub active_db_colour: Option<String>,
    pub tab_type: TabType,
    /// Set for table tabs only
    pub connection_id: Option<i64>,
    pub db_name: Option<String>,
    pub connection_name: Option<String>,
    /// Last output; only filled in for the active tab
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// Input for creating a new tab
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTabInput {
    pub tab_type: TabType,
    pub name: Option<String>,
    pub active_context: Option<ActiveContext>,
    pub connection_id: Option<i64>,
    pub db_name: Option<String>,
    pub connection_name: Option<String>,
}

impl CreateTabInput {
    pub fn editor() -> Self {
        Self {
            tab_type: TabType::Editor,
            name: None,
            active_context: None,
            connection_id: None,
            db_name: None,
            connection_name: None,
        }
    }

    pub fn table(table: &str, connection_id: i64, db_name: &str, connection_name: &str) -> Self {
        Self {
            tab_type: TabType::Table,
            name: Some(table.to_string()),
            active_context: None,
            connection_id: Some(connection_id),
            db_name: Some(db_name.to_string()),
            connection_name: Some(connection_name.to_string()),
        }
    }

    pub fn with_context(mut self, context: ActiveContext) -> Self {
        self.active_context = Some(context);
        self
    }
}

const SELECT_TAB: &str = "SELECT id, name, editor, output, is_active, active_pool_id, active_db, active_db_colour, tab_type, connection_id, db_name, connection_name FROM tabs";

/// Tab plus its raw stored output
fn tab_from_row(row: &Row<'_>) -> rusqlite::Result<(Tab, String)> {
    let pool_id: Option<String> = row.get(5)?;
    let tab_type: String = row.get(8)?;
    let tab = Tab {
        id: row.get(0)?,
        name: row.get(1)?,
        editor: row.get(2)?,
        is_active: row.get(4)?,
        active_pool_id: pool_id.and_then(|id| id.parse().ok()),
        active_db: row.get(6)?,
        active_db_colour: row.get(7)?,
        tab_type: TabType::parse(&tab_type).unwrap_or(TabType::Editor),
        connection_id: row.get(9)?,
        db_name: row.get(10)?,
        connection_name: row.get(11)?,
        columns: Vec::new(),
        rows: Vec::new(),
    };
    Ok((tab, row.get(3)?))
}

fn with_output(mut tab: Tab, raw: &str) -> StorageResult<Tab> {
    if !raw.is_empty() {
        let output: TabOutput = serde_json::from_str(raw)?;
        tab.columns = output.columns;
        tab.rows = output.rows;
    }
    Ok(tab)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl DatabaseManager {
    /// Create a tab; it becomes the only active tab
    pub fn create_tab(&self, input: CreateTabInput) -> StorageResult<Tab> {
        let (connection_id, db_name) = match input.tab_type {
            TabType::Table => {
                let connection_id = input.connection_id.filter(|id| *id != 0).ok_or_else(|| {
                    StorageError::Validation(
                        "connection id is required for tab type table".to_string(),
                    )
                })?;
                let db_name = non_empty(input.db_name).ok_or_else(|| {
                    StorageError::Validation(
                        "database name is required for tab type table".to_string(),
                    )
                })?;
                (Some(connection_id), Some(db_name))
            }
            TabType::Editor => (None, None),
        };

        let name = non_empty(input.name).unwrap_or_else(|| DEFAULT_TAB_NAME.to_string());
        let context = input.active_context;

        let id = self.with_connection_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO tabs (name, editor, output, is_active, active_pool_id, active_db, active_db_colour, tab_type, connection_id, db_name, connection_name)
                VALUES (?1, '', '', 1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    name,
                    context.as_ref().map(|c| c.handle.to_string()),
                    context.as_ref().map(|c| c.label.clone()),
                    context.as_ref().and_then(|c| c.colour.clone()),
                    input.tab_type.as_str(),
                    connection_id,
                    db_name,
                    input.connection_name
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute("UPDATE tabs SET is_active = 0 WHERE id != ?1", params![id])?;
            tx.commit()?;
            Ok(id)
        })?;

        tracing::debug!(tab_id = id, tab_type = input.tab_type.as_str(), "tab created");

        self.get_tab(id)?
            .ok_or_else(|| StorageError::NotFound(format!("tab {}", id)))
    }

    /// Get a tab by ID, without its output
    pub fn get_tab(&self, id: i64) -> StorageResult<Option<Tab>> {
        let found = self.with_connection(|conn| {
            conn.query_row(&format!("{} WHERE id = ?1", SELECT_TAB), params![id], tab_from_row)
                .optional()
        })?;
        Ok(found.map(|(tab, _)| tab))
    }

    /// Make `id` the only active tab and return it with its last output
    pub fn set_active_tab(&self, id: i64) -> StorageResult<Tab> {
        let found = self.with_connection_mut(|conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute("UPDATE tabs SET is_active = 1 WHERE id = ?1", params![id])?;
            if updated == 0 {
                return Ok(None);
            }
            tx.execute("UPDATE tabs SET is_active = 0 WHERE id != ?1", params![id])?;
            let found = tx.query_row(&format!("{} WHERE id = ?1", SELECT_TAB), params![id], tab_from_row)?;
            tx.commit()?;
            Ok(Some(found))
        })?;

        let (tab, raw) = found.ok_or_else(|| StorageError::NotFound(format!("tab {}", id)))?;
        with_output(tab, &raw)
    }

    /// All tabs in creation order; output is decoded for the active tab only
    pub fn get_all_tabs(&self) -> StorageResult<Vec<Tab>> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!("{} ORDER BY id", SELECT_TAB))?;
            let rows = stmt
                .query_map([], tab_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(tab, raw)| {
                if tab.is_active {
                    with_output(tab, &raw)
                } else {
                    Ok(tab)
                }
            })
            .collect()
    }

    /// Delete a tab. When it was active and others remain, the first remaining
    /// tab becomes active and is returned with its output.
    pub fn delete_tab(&self, id: i64) -> StorageResult<Option<Tab>> {
        let next = self.with_connection_mut(|conn| {
            let is_active: Option<bool> = conn
                .query_row("SELECT is_active FROM tabs WHERE id = ?1", params![id], |row| row.get(0))
                .optional()?;
            let Some(is_active) = is_active else {
                return Ok(Err(()));
            };

            let tx = conn.transaction()?;
            tx.execute("DELETE FROM tabs WHERE id = ?1", params![id])?;

            let mut next = None;
            if is_active {
                let next_id: Option<i64> = tx
                    .query_row("SELECT id FROM tabs ORDER BY id LIMIT 1", [], |row| row.get(0))
                    .optional()?;
                if let Some(next_id) = next_id {
                    tx.execute("UPDATE tabs SET is_active = 1 WHERE id = ?1", params![next_id])?;
                    next = Some(tx.query_row(
                        &format!("{} WHERE id = ?1", SELECT_TAB),
                        params![next_id],
                        tab_from_row,
                    )?);
                }
            }
            tx.commit()?;
            Ok(Ok(next))
        })?;

        match next {
            Err(()) => Err(StorageError::NotFound(format!("tab {}", id))),
            Ok(Some((tab, raw))) => with_output(tab, &raw).map(Some),
            Ok(None) => Ok(None),
        }
    }

    /// Save editor content (called on every keystroke batch)
    pub fn update_tab_editor(&self, id: i64, editor: &str) -> StorageResult<bool> {
        self.with_connection(|conn| {
            let rows_affected = conn.execute(
                "UPDATE tabs SET editor = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![editor, id],
            )?;
            Ok(rows_affected > 0)
        })
    }

    /// Bind (or with `None`, unbind) an editor tab. Table tabs keep their binding.
    pub fn save_active_context(&self, id: i64, context: Option<&ActiveContext>) -> StorageResult<bool> {
        self.with_connection(|conn| {
            let rows_affected = conn.execute(
                r#"
                UPDATE tabs SET active_pool_id = ?1, active_db = ?2, active_db_colour = ?3, updated_at = datetime('now')
                WHERE id = ?4 AND tab_type = 'editor'
                "#,
                params![
                    context.map(|c| c.handle.to_string()),
                    context.map(|c| c.label.clone()),
                    context.and_then(|c| c.colour.clone()),
                    id
                ],
            )?;
            Ok(rows_affected > 0)
        })
    }
}

impl SessionStore for DatabaseManager {
    fn apply_active_context(
        &self,
        scope: &ActivationScope,
        context: &ActiveContext,
    ) -> StorageResult<usize> {
        let handle = context.handle.to_string();
        self.with_connection(|conn| match scope {
            ActivationScope::Editors => conn.execute(
                r#"
                UPDATE tabs SET active_pool_id = ?1, active_db = ?2, active_db_colour = ?3
                WHERE active_pool_id IS NULL AND tab_type = 'editor'
                "#,
                params![handle, context.label, context.colour],
            ),
            ActivationScope::Tables {
                connection_id,
                database,
            } => conn.execute(
                r#"
                UPDATE tabs SET active_pool_id = ?1, active_db = ?2, active_db_colour = ?3
                WHERE active_pool_id IS NULL AND tab_type = 'table' AND connection_id = ?4 AND db_name = ?5
                "#,
                params![handle, context.label, context.colour, connection_id, database],
            ),
        })
    }

    fn clear_active_context(&self, handles: &[PoolHandle]) -> StorageResult<usize> {
        if handles.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; handles.len()].join(",");
        let sql = format!(
            "UPDATE tabs SET active_pool_id = NULL, active_db = NULL, active_db_colour = NULL WHERE active_pool_id IN ({})",
            placeholders
        );
        self.with_connection(|conn| {
            conn.execute(&sql, params_from_iter(handles.iter().map(|h| h.to_string())))
        })
    }

    fn persist_output(&self, tab_id: i64, output: &TabOutput) -> StorageResult<()> {
        let json = serde_json::to_string(output)?;
        let updated = self.with_connection(|conn| {
            conn.execute(
                "UPDATE tabs SET output = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![json, tab_id],
            )
        })?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("tab {}", tab_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn create_test_db() -> (DatabaseManager, PathBuf) {
        let temp_dir = std::env::temp_dir();
        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let db_path = temp_dir.join(format!(
            "poolside_tabs_test_{}_{}.db",
            std::process::id(),
            counter
        ));
        let _ = std::fs::remove_file(&db_path);
        let manager = DatabaseManager::new(db_path.clone()).unwrap();
        (manager, db_path)
    }

    fn sample_output() -> TabOutput {
        TabOutput {
            columns: vec!["id".to_string()],
            rows: vec![vec![Cell::new("id", "1")]],
        }
    }

    #[test]
    fn test_create_tab() {
        let (manager, db_path) = create_test_db();

        let tab = manager.create_tab(CreateTabInput::editor()).unwrap();
        assert_eq!(tab.name, "Editor");
        assert_eq!(tab.tab_type, TabType::Editor);
        assert!(tab.is_active);
        assert_eq!(tab.active_pool_id, None);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn test_new_tab_is_only_active_tab() {
        let (manager, db_path) = create_test_db();

        let first = manager.create_tab(CreateTabInput::editor()).unwrap();
        let second = manager
            .create_tab(CreateTabInput::table("users", 1, "app", "Local"))
            .unwrap();

        let tabs = manager.get_all_tabs().unwrap();
        let active: Vec<i64> = tabs.iter().filter(|t| t.is_active).map(|t| t.id).collect();
        assert_eq!(active, vec![second.id]);
        assert!(!manager.get_tab(first.id).unwrap().unwrap().is_active);
        assert_eq!(second.name, "users");
        assert_eq!(second.db_name.as_deref(), Some("app"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn test_table_tab_requires_connection_and_database() {
        let (manager, db_path) = create_test_db();

        let err = manager
            .create_tab(CreateTabInput::table("users", 0, "app", "Local"))
            .unwrap_err();
        assert!(err.to_string().contains("connection id is required"));

        let err = manager
            .create_tab(CreateTabInput::table("users", 1, " ", "Local"))
            .unwrap_err();
        assert!(err.to_string().contains("database name is required"));

        assert!(manager.get_all_tabs().unwrap().is_empty());

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn test_create_with_context() {
        let (manager, db_path) = create_test_db();

        let context = ActiveContext {
            handle: PoolHandle::new(),
            label: "Local - app".to_string(),
            colour: None,
        };
        let tab = manager
            .create_tab(CreateTabInput::editor().with_context(context.clone()))
            .unwrap();
        assert_eq!(tab.active_pool_id, Some(context.handle));
        assert_eq!(tab.active_db.as_deref(), Some("Local - app"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn test_output_only_decoded_for_active_tab() {
        let (manager, db_path) = create_test_db();

        let first = manager.create_tab(CreateTabInput::editor()).unwrap();
        manager.persist_output(first.id, &sample_output()).unwrap();
        let second = manager.create_tab(CreateTabInput::editor()).unwrap();
        manager.persist_output(second.id, &sample_output()).unwrap();

        let tabs = manager.get_all_tabs().unwrap();
        assert!(tabs[0].columns.is_empty());
        assert_eq!(tabs[1].columns, vec!["id".to_string()]);

        let activated = manager.set_active_tab(first.id).unwrap();
        assert_eq!(activated.rows, sample_output().rows);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn test_set_active_tab_missing() {
        let (manager, db_path) = create_test_db();

        let tab = manager.create_tab(CreateTabInput::editor()).unwrap();
        assert!(matches!(
            manager.set_active_tab(tab.id + 10),
            Err(StorageError::NotFound(_))
        ));
        // The existing tab is still active
        assert!(manager.get_tab(tab.id).unwrap().unwrap().is_active);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn test_delete_active_tab_activates_another() {
        let (manager, db_path) = create_test_db();

        let first = manager.create_tab(CreateTabInput::editor()).unwrap();
        manager.persist_output(first.id, &sample_output()).unwrap();
        let second = manager.create_tab(CreateTabInput::editor()).unwrap();

        let next = manager.delete_tab(second.id).unwrap().unwrap();
        assert_eq!(next.id, first.id);
        assert!(next.is_active);
        assert_eq!(next.columns, vec!["id".to_string()]);

        // Last tab: nothing left to activate
        assert!(manager.delete_tab(first.id).unwrap().is_none());
        assert!(matches!(manager.delete_tab(first.id), Err(StorageError::NotFound(_))));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn test_delete_inactive_tab_returns_none() {
        let (manager, db_path) = create_test_db();

        let first = manager.create_tab(CreateTabInput::editor()).unwrap();
        let second = manager.create_tab(CreateTabInput::editor()).unwrap();

        assert!(manager.delete_tab(first.id).unwrap().is_none());
        assert!(manager.get_tab(second.id).unwrap().unwrap().is_active);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn test_update_tab_editor() {
        let (manager, db_path) = create_test_db();

        let tab = manager.create_tab(CreateTabInput::editor()).unwrap();
        assert!(manager.update_tab_editor(tab.id, "SELECT 1").unwrap());
        assert_eq!(manager.get_tab(tab.id).unwrap().unwrap().editor, "SELECT 1");
        assert!(!manager.update_tab_editor(tab.id + 1, "SELECT 2").unwrap());

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn test_save_active_context_editor_only() {
        let (manager, db_path) = create_test_db();

        let editor = manager.create_tab(CreateTabInput::editor()).unwrap();
        let table = manager
            .create_tab(CreateTabInput::table("users", 1, "app", "Local"))
            .unwrap();
        let context = ActiveContext {
            handle: PoolHandle::new(),
            label: "Local - app".to_string(),
            colour: Some("#fff".to_string()),
        };

        assert!(manager.save_active_context(editor.id, Some(&context)).unwrap());
        assert!(!manager.save_active_context(table.id, Some(&context)).unwrap());

        let saved = manager.get_tab(editor.id).unwrap().unwrap();
        assert_eq!(saved.active_pool_id, Some(context.handle));
        assert_eq!(saved.active_db_colour.as_deref(), Some("#fff"));

        assert!(manager.save_active_context(editor.id, None).unwrap());
        assert_eq!(manager.get_tab(editor.id).unwrap().unwrap().active_pool_id, None);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn test_clear_many_handles() {
        let (manager, db_path) = create_test_db();

        let handles: Vec<PoolHandle> = (0..3).map(|_| PoolHandle::new()).collect();
        for handle in &handles {
            let tab = manager.create_tab(CreateTabInput::editor()).unwrap();
            let context = ActiveContext {
                handle: *handle,
                label: "x".to_string(),
                colour: None,
            };
            manager.save_active_context(tab.id, Some(&context)).unwrap();
        }

        assert_eq!(manager.clear_active_context(&handles[..2]).unwrap(), 2);
        let bound: Vec<_> = manager
            .get_all_tabs()
            .unwrap()
            .into_iter()
            .filter_map(|t| t.active_pool_id)
            .collect();
        assert_eq!(bound, vec![handles[2]]);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn test_persist_output_unknown_tab() {
        let (manager, db_path) = create_test_db();

        assert!(matches!(
            manager.persist_output(42, &sample_output()),
            Err(StorageError::NotFound(_))
        ));

        let _ = std::fs::remove_file(&db_path);
    }
}
