use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "evaldesk.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tests(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            imported_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            test_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            qtype TEXT NOT NULL,
            max_scale INTEGER,
            question_text TEXT NOT NULL,
            raw_row TEXT NOT NULL,
            PRIMARY KEY(test_id, question_id),
            FOREIGN KEY(test_id) REFERENCES tests(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_test ON questions(test_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS response_docs(
            doc_id TEXT PRIMARY KEY,
            roll TEXT NOT NULL,
            test_id TEXT NOT NULL,
            imported_at TEXT,
            UNIQUE(roll, test_id)
        )",
        [],
    )?;
    // Roll lookups back the sibling enumeration in the aggregator; a full
    // table scan is only acceptable for tiny datasets.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_response_docs_roll ON response_docs(roll)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS responses(
            doc_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            response TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(doc_id, question_id),
            FOREIGN KEY(doc_id) REFERENCES response_docs(doc_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_doc ON responses(doc_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluations(
            doc_id TEXT PRIMARY KEY,
            mcq_total INTEGER,
            likert_total INTEGER,
            text_total INTEGER,
            text_marks TEXT,
            final_total INTEGER,
            grand_total INTEGER,
            updated_at TEXT,
            FOREIGN KEY(doc_id) REFERENCES response_docs(doc_id)
        )",
        [],
    )?;
    ensure_evaluations_updated_at(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS save_log(
            id TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL,
            roll TEXT NOT NULL,
            final_total INTEGER NOT NULL,
            grand_total INTEGER NOT NULL,
            saved_at TEXT NOT NULL,
            FOREIGN KEY(doc_id) REFERENCES response_docs(doc_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_save_log_doc ON save_log(doc_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_evaluations_updated_at(conn: &Connection) -> anyhow::Result<()> {
    // Workspaces created before the audit trail landed lack updated_at.
    if table_has_column(conn, "evaluations", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE evaluations ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
