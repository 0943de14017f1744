//! Domain entity tables
//!
//! Row access for spaces, repetitive task templates, tasks and tags.
//! Writes go through last-write-wins upserts: an incoming row replaces the
//! stored one only when its `modified_at` is greater than or equal to the
//! stored value, so ties favour the incoming version.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::error::StorageResult;
use super::{from_millis, to_millis};
use crate::models::{EntityPayload, EntityType, RepetitiveTaskTemplate, Space, Tag, Task};

/// Upsert any entity; returns whether the row was written
pub fn upsert(conn: &Connection, entity: &EntityPayload) -> StorageResult<bool> {
    match entity {
        EntityPayload::Task(t) => upsert_task(conn, t),
        EntityPayload::Space(s) => upsert_space(conn, s),
        EntityPayload::Tag(t) => upsert_tag(conn, t),
        EntityPayload::RepetitiveTaskTemplate(t) => upsert_template(conn, t),
    }
}

pub fn upsert_space(conn: &Connection, space: &Space) -> StorageResult<bool> {
    let changed = conn.execute(
        r#"INSERT INTO spaces (id, name, color, created_at, modified_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               color = excluded.color,
               created_at = excluded.created_at,
               modified_at = excluded.modified_at
           WHERE excluded.modified_at >= spaces.modified_at"#,
        params![
            space.id,
            space.name,
            space.color,
            to_millis(space.created_at),
            to_millis(space.modified_at),
        ],
    )?;
    Ok(changed > 0)
}

pub fn upsert_template(conn: &Connection, template: &RepetitiveTaskTemplate) -> StorageResult<bool> {
    let changed = conn.execute(
        r#"INSERT INTO repetitive_task_templates
               (id, title, space_id, recurrence, created_at, modified_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT(id) DO UPDATE SET
               title = excluded.title,
               space_id = excluded.space_id,
               recurrence = excluded.recurrence,
               created_at = excluded.created_at,
               modified_at = excluded.modified_at
           WHERE excluded.modified_at >= repetitive_task_templates.modified_at"#,
        params![
            template.id,
            template.title,
            template.space_id,
            template.recurrence,
            to_millis(template.created_at),
            to_millis(template.modified_at),
        ],
    )?;
    Ok(changed > 0)
}

pub fn upsert_task(conn: &Connection, task: &Task) -> StorageResult<bool> {
    let changed = conn.execute(
        r#"INSERT INTO tasks
               (id, title, notes, space_id, template_id, due_at, completed_at, created_at, modified_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
           ON CONFLICT(id) DO UPDATE SET
               title = excluded.title,
               notes = excluded.notes,
               space_id = excluded.space_id,
               template_id = excluded.template_id,
               due_at = excluded.due_at,
               completed_at = excluded.completed_at,
               created_at = excluded.created_at,
               modified_at = excluded.modified_at
           WHERE excluded.modified_at >= tasks.modified_at"#,
        params![
            task.id,
            task.title,
            task.notes,
            task.space_id,
            task.template_id,
            task.due_at.map(to_millis),
            task.completed_at.map(to_millis),
            to_millis(task.created_at),
            to_millis(task.modified_at),
        ],
    )?;
    Ok(changed > 0)
}

pub fn upsert_tag(conn: &Connection, tag: &Tag) -> StorageResult<bool> {
    let changed = conn.execute(
        r#"INSERT INTO tags (id, name, created_at, modified_at)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               created_at = excluded.created_at,
               modified_at = excluded.modified_at
           WHERE excluded.modified_at >= tags.modified_at"#,
        params![
            tag.id,
            tag.name,
            to_millis(tag.created_at),
            to_millis(tag.modified_at),
        ],
    )?;
    Ok(changed > 0)
}

/// Remove a local row; returns whether it existed
pub fn delete(conn: &Connection, entity_type: EntityType, id: &str) -> StorageResult<bool> {
    // Table names come from a closed enum, never from input
    let sql = format!("DELETE FROM {} WHERE id = ?1", entity_type.table());
    let changed = conn.execute(&sql, params![id])?;
    Ok(changed > 0)
}

/// Point child rows that reference `old_id` at `new_id`
pub fn remap_references(conn: &Connection, old_id: &str, new_id: &str) -> StorageResult<usize> {
    let mut changed = conn.execute(
        "UPDATE tasks SET space_id = ?2 WHERE space_id = ?1",
        params![old_id, new_id],
    )?;
    changed += conn.execute(
        "UPDATE tasks SET template_id = ?2 WHERE template_id = ?1",
        params![old_id, new_id],
    )?;
    changed += conn.execute(
        "UPDATE repetitive_task_templates SET space_id = ?2 WHERE space_id = ?1",
        params![old_id, new_id],
    )?;
    Ok(changed)
}

/// Number of rows of one type
pub fn count(conn: &Connection, entity_type: EntityType) -> StorageResult<u64> {
    let sql = format!("SELECT COUNT(*) FROM {}", entity_type.table());
    let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(u64::try_from(n).unwrap_or(0))
}

/// Fetch any entity by type and id
pub fn get(
    conn: &Connection,
    entity_type: EntityType,
    id: &str,
) -> StorageResult<Option<EntityPayload>> {
    Ok(match entity_type {
        EntityType::Task => get_task(conn, id)?.map(EntityPayload::Task),
        EntityType::Space => get_space(conn, id)?.map(EntityPayload::Space),
        EntityType::Tag => get_tag(conn, id)?.map(EntityPayload::Tag),
        EntityType::RepetitiveTaskTemplate => {
            get_template(conn, id)?.map(EntityPayload::RepetitiveTaskTemplate)
        }
    })
}

pub fn get_task(conn: &Connection, id: &str) -> StorageResult<Option<Task>> {
    Ok(conn
        .query_row(
            "SELECT id, title, notes, space_id, template_id, due_at, completed_at, created_at, modified_at
             FROM tasks WHERE id = ?1",
            params![id],
            task_from_row,
        )
        .optional()?)
}

/// All tasks, most recently modified first
pub fn list_tasks(conn: &Connection) -> StorageResult<Vec<Task>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, notes, space_id, template_id, due_at, completed_at, created_at, modified_at
         FROM tasks ORDER BY modified_at DESC",
    )?;
    let rows = stmt.query_map([], task_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_space(conn: &Connection, id: &str) -> StorageResult<Option<Space>> {
    Ok(conn
        .query_row(
            "SELECT id, name, color, created_at, modified_at FROM spaces WHERE id = ?1",
            params![id],
            |row| {
                Ok(Space {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    color: row.get(2)?,
                    created_at: from_millis(row.get(3)?),
                    modified_at: from_millis(row.get(4)?),
                })
            },
        )
        .optional()?)
}

pub fn get_template(conn: &Connection, id: &str) -> StorageResult<Option<RepetitiveTaskTemplate>> {
    Ok(conn
        .query_row(
            "SELECT id, title, space_id, recurrence, created_at, modified_at
             FROM repetitive_task_templates WHERE id = ?1",
            params![id],
            |row| {
                Ok(RepetitiveTaskTemplate {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    space_id: row.get(2)?,
                    recurrence: row.get(3)?,
                    created_at: from_millis(row.get(4)?),
                    modified_at: from_millis(row.get(5)?),
                })
            },
        )
        .optional()?)
}

pub fn get_tag(conn: &Connection, id: &str) -> StorageResult<Option<Tag>> {
    Ok(conn
        .query_row(
            "SELECT id, name, created_at, modified_at FROM tags WHERE id = ?1",
            params![id],
            |row| {
                Ok(Tag {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: from_millis(row.get(2)?),
                    modified_at: from_millis(row.get(3)?),
                })
            },
        )
        .optional()?)
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        notes: row.get(2)?,
        space_id: row.get(3)?,
        template_id: row.get(4)?,
        due_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
        completed_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        created_at: from_millis(row.get(7)?),
        modified_at: from_millis(row.get(8)?),
    })
}
